//! Core domain model for jobwatch: canonical postings, the user profile,
//! normalization of raw source records, the eligibility predicate and the
//! digest formatter.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "jobwatch-core";

/// Column order of the persisted history ledger.
pub const HISTORY_HEADER: [&str; 6] = [
    "extraction_time",
    "source",
    "title",
    "company",
    "location",
    "url",
];

pub const NO_MATCHES_MESSAGE: &str = "⚠️ No job postings matched your profile today.";

const DIGEST_HEADER: &str = "📢 *Job postings found:*";

/// Substrings that mark a posting as location independent. Matched against the
/// lower-cased content blob and location.
pub const REMOTE_INDICATORS: &[&str] = &[
    "remote",
    "remoto",
    "en remoto",
    "teletrabajo",
    "teletrabajar",
    "telework",
    "telecommute",
    "work from home",
    "wfh",
    "hybrid",
    "híbrido",
    "hibrido",
    "a distancia",
    "anywhere",
];

/// Query parameters that carry session or tracking state and never identify a posting.
const TRACKING_PARAMS: &[&str] = &[
    "trk",
    "trkinfo",
    "refid",
    "trackingid",
    "position",
    "pagenum",
    "originalsubdomain",
    "from",
    "tk",
    "vjs",
    "bb",
    "advn",
    "xkcb",
    "xpse",
    "xfps",
    "sa",
    "fccid",
    "gclid",
    "fbclid",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    LinkedIn,
    InfoJobs,
    Indeed,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::LinkedIn, Source::InfoJobs, Source::Indeed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::LinkedIn => "linkedin",
            Source::InfoJobs => "infojobs",
            Source::Indeed => "indeed",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Source::LinkedIn => "LinkedIn",
            Source::InfoJobs => "InfoJobs",
            Source::Indeed => "Indeed",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source `{0}`")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linkedin" => Ok(Source::LinkedIn),
            "infojobs" => Ok(Source::InfoJobs),
            "indeed" => Ok(Source::Indeed),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

/// Handoff contract from source adapters into the pipeline. Every field is
/// optional; the normalizer decides what is required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
}

/// Canonical representation of one job listing after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub source: Source,
    pub title: String,
    pub company: String,
    pub location: String,
    pub observed_at: DateTime<Utc>,
    pub url: String,
}

impl Posting {
    /// Composite key used for duplicate suppression within a single run.
    pub fn identity_key(&self) -> (String, String, String) {
        (
            self.title.trim().to_lowercase(),
            self.company.trim().to_lowercase(),
            self.url.trim().to_lowercase(),
        )
    }

    /// Lower-cased url, the key for cross-run history membership.
    pub fn history_key(&self) -> String {
        history_key(&self.url)
    }
}

pub fn history_key(url: &str) -> String {
    url.trim().to_lowercase()
}

/// One row of the history ledger. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub extraction_time: DateTime<Utc>,
    pub source: Source,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
}

impl HistoryEntry {
    pub fn from_posting(posting: &Posting, extraction_time: DateTime<Utc>) -> Self {
        Self {
            extraction_time,
            source: posting.source,
            title: posting.title.clone(),
            company: posting.company.clone(),
            location: posting.location.clone(),
            url: posting.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("record has no title")]
    MissingTitle,
    #[error("record has no url")]
    MissingUrl,
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Convert one raw record into a canonical `Posting`.
pub fn normalize_record(
    raw: &RawRecord,
    source: Source,
    observed_at: DateTime<Utc>,
) -> Result<Posting, NormalizationError> {
    let title = raw
        .title
        .as_deref()
        .map(collapse_whitespace)
        .filter(|t| !t.is_empty())
        .ok_or(NormalizationError::MissingTitle)?;
    let raw_url = raw
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or(NormalizationError::MissingUrl)?;
    let url = canonicalize_url(raw_url)?;

    Ok(Posting {
        source,
        title,
        company: raw.company.as_deref().map(collapse_whitespace).unwrap_or_default(),
        location: raw.location.as_deref().map(collapse_whitespace).unwrap_or_default(),
        observed_at,
        url,
    })
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("utm_") || TRACKING_PARAMS.contains(&lower.as_str())
}

/// Strip the fragment and tracking query parameters so the same posting maps to
/// the same url across runs.
pub fn canonicalize_url(input: &str) -> Result<String, NormalizationError> {
    let mut url = Url::parse(input.trim()).map_err(|e| NormalizationError::InvalidUrl {
        url: input.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(NormalizationError::InvalidUrl {
            url: input.to_string(),
            reason: format!("unsupported scheme `{}`", url.scheme()),
        });
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    url.set_fragment(None);
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept.iter());
    }
    Ok(url.to_string())
}

/// User filtering configuration, immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub include_locations: Vec<String>,
    pub remote_allowed: bool,
    pub recency_window: Duration,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            include_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            include_locations: Vec::new(),
            remote_allowed: true,
            recency_window: Duration::hours(24),
        }
    }
}

impl Profile {
    pub fn new<I, E, L>(
        include_keywords: I,
        exclude_keywords: E,
        include_locations: L,
        remote_allowed: bool,
        recency_window: Duration,
    ) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
        L: IntoIterator,
        L::Item: AsRef<str>,
    {
        Self {
            include_keywords: normalize_terms(include_keywords),
            exclude_keywords: normalize_terms(exclude_keywords),
            include_locations: normalize_terms(include_locations),
            remote_allowed,
            recency_window,
        }
    }
}

/// Trim, lower-case and drop blank terms, keeping first-seen order.
pub fn normalize_terms<T>(terms: T) -> Vec<String>
where
    T: IntoIterator,
    T::Item: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for term in terms {
        let term = term.as_ref().trim().to_lowercase();
        if !term.is_empty() && !out.contains(&term) {
            out.push(term);
        }
    }
    out
}

fn matches_any(haystack: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .map(|n| n.trim().to_lowercase())
        .filter(|n| !n.is_empty())
        .any(|n| haystack.contains(&n))
}

fn has_terms(terms: &[String]) -> bool {
    terms.iter().any(|t| !t.trim().is_empty())
}

pub fn is_remote_friendly(content_blob: &str, location: &str) -> bool {
    REMOTE_INDICATORS
        .iter()
        .any(|ind| content_blob.contains(ind) || location.contains(ind))
}

/// Pure eligibility predicate. The result depends only on the posting, the
/// profile and the supplied clock.
pub fn is_eligible(posting: &Posting, profile: &Profile, now: DateTime<Utc>) -> bool {
    let content = format!("{} {}", posting.title, posting.company).to_lowercase();
    let location = posting.location.to_lowercase();

    if has_terms(&profile.include_keywords) && !matches_any(&content, &profile.include_keywords) {
        return false;
    }
    if matches_any(&content, &profile.exclude_keywords) {
        return false;
    }

    let location_ok = if profile.remote_allowed && is_remote_friendly(&content, &location) {
        true
    } else if has_terms(&profile.include_locations) {
        matches_any(&location, &profile.include_locations)
    } else {
        true
    };
    if !location_ok {
        return false;
    }

    now.signed_duration_since(posting.observed_at) <= profile.recency_window
}

/// Escape characters that carry meaning in Telegram's legacy Markdown.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn or_dash(value: &str) -> String {
    if value.trim().is_empty() {
        "-".to_string()
    } else {
        escape_markdown(value)
    }
}

/// Render one block of the digest.
pub fn format_posting_block(posting: &Posting) -> String {
    format!(
        "📌 *{}*\n🏢 {}\n📍 {}\n🗓 {}\n🔗 [View posting]({})\n",
        escape_markdown(&posting.title),
        or_dash(&posting.company),
        or_dash(&posting.location),
        posting.observed_at.format("%d/%m/%Y"),
        posting.url
    )
}

/// Render surviving postings into a digest, preserving input order.
pub fn format_digest(postings: &[Posting]) -> String {
    if postings.is_empty() {
        return NO_MATCHES_MESSAGE.to_string();
    }
    let mut msg = format!("{DIGEST_HEADER}\n\n");
    for posting in postings {
        msg.push_str(&format_posting_block(posting));
        msg.push('\n');
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).single().unwrap()
    }

    fn posting(title: &str, company: &str, location: &str, url: &str) -> Posting {
        Posting {
            source: Source::LinkedIn,
            title: title.to_string(),
            company: company.to_string(),
            location: location.to_string(),
            observed_at: ts(),
            url: url.to_string(),
        }
    }

    fn profile() -> Profile {
        Profile::new(["data"], ["intern"], ["madrid"], true, Duration::hours(24))
    }

    #[test]
    fn normalizer_defaults_optional_fields_to_empty() {
        let raw = RawRecord {
            title: Some("  Data   Engineer ".into()),
            company: None,
            location: None,
            url: Some("https://example.com/jobs/1".into()),
        };
        let p = normalize_record(&raw, Source::Indeed, ts()).unwrap();
        assert_eq!(p.title, "Data Engineer");
        assert_eq!(p.company, "");
        assert_eq!(p.location, "");
        assert_eq!(p.source, Source::Indeed);
        assert_eq!(p.observed_at, ts());
    }

    #[test]
    fn normalizer_rejects_missing_title_or_url() {
        let no_title = RawRecord {
            title: Some("   ".into()),
            url: Some("https://example.com/1".into()),
            ..Default::default()
        };
        assert_eq!(
            normalize_record(&no_title, Source::LinkedIn, ts()),
            Err(NormalizationError::MissingTitle)
        );

        let no_url = RawRecord {
            title: Some("Analyst".into()),
            ..Default::default()
        };
        assert_eq!(
            normalize_record(&no_url, Source::LinkedIn, ts()),
            Err(NormalizationError::MissingUrl)
        );

        let bad_url = RawRecord {
            title: Some("Analyst".into()),
            url: Some("/relative/only".into()),
            ..Default::default()
        };
        assert!(matches!(
            normalize_record(&bad_url, Source::LinkedIn, ts()),
            Err(NormalizationError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn canonical_url_drops_tracking_params_and_fragment() {
        assert_eq!(
            canonicalize_url(
                "https://es.linkedin.com/jobs/view/data-engineer-123?refId=abc&trackingId=xyz&position=2&pageNum=0#top"
            )
            .unwrap(),
            "https://es.linkedin.com/jobs/view/data-engineer-123"
        );
        assert_eq!(
            canonicalize_url("https://es.indeed.com/rc/clk?jk=4f2a&from=vj&utm_source=x&tk=1h2").unwrap(),
            "https://es.indeed.com/rc/clk?jk=4f2a"
        );
    }

    #[test]
    fn indeed_search_session_token_does_not_change_the_url() {
        let first = canonicalize_url(
            "https://es.indeed.com/rc/clk?jk=a1b2c3d4e5f60718&bb=xyz&from=serp&vjs=3",
        )
        .unwrap();
        let second = canonicalize_url(
            "https://es.indeed.com/rc/clk?jk=a1b2c3d4e5f60718&bb=other&from=serp&vjs=3",
        )
        .unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "https://es.indeed.com/rc/clk?jk=a1b2c3d4e5f60718");
    }

    #[test]
    fn canonical_url_is_stable_across_session_params() {
        let a = canonicalize_url("https://www.infojobs.net/madrid/data/of-i123?applicationOrigin=search&utm_campaign=a").unwrap();
        let b = canonicalize_url("https://www.infojobs.net/madrid/data/of-i123?applicationOrigin=search&utm_campaign=b").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exclude_always_wins() {
        let p = posting("Data Intern", "Acme", "Madrid", "https://x/2");
        assert!(!is_eligible(&p, &profile(), ts()));
    }

    #[test]
    fn include_keyword_required_when_configured() {
        let p = posting("Sales Rep", "Acme", "Madrid", "https://x/3");
        assert!(!is_eligible(&p, &profile(), ts()));

        let open = Profile::default();
        assert!(is_eligible(&p, &open, ts()));
    }

    #[test]
    fn include_keywords_match_company_too() {
        let p = posting("Engineer", "Big Data Corp", "Madrid", "https://x/4");
        assert!(is_eligible(&p, &profile(), ts()));
    }

    #[test]
    fn remote_override_ignores_location_list() {
        let p = posting("Data Engineer", "Acme", "Remote", "https://x/1");
        assert!(is_eligible(&p, &profile(), ts()));

        let spanish = posting("Data Analyst (Teletrabajo)", "Acme", "Sevilla", "https://x/5");
        assert!(is_eligible(&spanish, &profile(), ts()));
    }

    #[test]
    fn remote_posting_without_permission_needs_location_match() {
        let mut prof = profile();
        prof.remote_allowed = false;
        let remote_elsewhere = posting("Data Engineer", "Acme", "Remote, Lisbon", "https://x/1");
        assert!(!is_eligible(&remote_elsewhere, &prof, ts()));

        let madrid = posting("Data Engineer", "Acme", "Madrid, Comunidad de Madrid", "https://x/6");
        assert!(is_eligible(&madrid, &prof, ts()));
    }

    #[test]
    fn no_location_restriction_accepts_any_location() {
        let prof = Profile::new(["data"], Vec::<String>::new(), Vec::<String>::new(), false, Duration::hours(24));
        let p = posting("Data Engineer", "Acme", "Bilbao", "https://x/7");
        assert!(is_eligible(&p, &prof, ts()));
    }

    #[test]
    fn recency_window_rejects_old_observations() {
        let p = posting("Data Engineer", "Acme", "Madrid", "https://x/8");
        assert!(is_eligible(&p, &profile(), ts() + Duration::hours(24)));
        assert!(!is_eligible(&p, &profile(), ts() + Duration::hours(25)));
    }

    #[test]
    fn eligibility_is_deterministic() {
        let p = posting("Data Engineer", "Acme", "Remote", "https://x/1");
        let prof = profile();
        let first = is_eligible(&p, &prof, ts());
        for _ in 0..10 {
            assert_eq!(is_eligible(&p, &prof, ts()), first);
        }
    }

    #[test]
    fn blank_terms_are_ignored() {
        let prof = Profile::new(["", " "], [""], [" "], false, Duration::hours(24));
        assert!(prof.include_keywords.is_empty());
        assert!(prof.exclude_keywords.is_empty());
        let p = posting("Anything", "", "", "https://x/9");
        assert!(is_eligible(&p, &prof, ts()));
    }

    #[test]
    fn identity_key_is_case_and_space_insensitive() {
        let a = posting("Data Engineer ", "ACME", "Madrid", "https://X/1");
        let b = posting("data engineer", " acme", "Remote", "https://x/1");
        assert_eq!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn empty_digest_is_fixed_message() {
        assert_eq!(format_digest(&[]), NO_MATCHES_MESSAGE);
    }

    #[test]
    fn digest_renders_blocks_in_order() {
        let first = posting("Data_Engineer", "Acme", "Remote", "https://x/1");
        let second = posting("Data Analyst", "", "Madrid", "https://x/2");
        let text = format_digest(&[first, second]);
        assert!(text.starts_with(DIGEST_HEADER));
        let a = text.find("Data\\_Engineer").unwrap();
        let b = text.find("Data Analyst").unwrap();
        assert!(a < b);
        assert!(text.contains("🗓 02/03/2026"));
        assert!(text.contains("🏢 -"));
        assert!(text.contains("[View posting](https://x/2)"));
    }

    #[test]
    fn source_round_trips_through_str() {
        for source in Source::ALL {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
        assert!("monster".parse::<Source>().is_err());
    }
}
