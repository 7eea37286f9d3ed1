//! Source adapter contract + LinkedIn, InfoJobs and Indeed listing parsers.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{RawRecord, Source};
use jobwatch_storage::{FetchError, HttpFetcher};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub source: Source,
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
}

/// Per-source settings that do not belong in the listing URLs themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterSettings {
    /// Full `Authorization` header value, e.g. `Basic <token>`.
    pub authorization: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error("invalid JSON listing from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid header value for {0}")]
    Header(&'static str),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("all {0} listing targets failed")]
    AllTargetsFailed(usize),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    fn request_headers(&self) -> Result<HeaderMap, AdapterError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("es-ES,es;q=0.9,en;q=0.8"));
        Ok(headers)
    }

    /// Fetch every listing target. A failing target is skipped; the source
    /// fails only when no target could be fetched.
    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        targets: &[ListingTarget],
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let headers = self.request_headers()?;
        let mut pages = Vec::with_capacity(targets.len());
        let mut last_error = None;
        for target in targets {
            match http
                .fetch_bytes(ctx.run_id, self.source(), &target.url, &headers)
                .await
            {
                Ok(resp) => pages.push(FetchedPage {
                    source: self.source(),
                    url: resp.final_url,
                    content_type: resp
                        .content_type
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    body: resp.body,
                    fetched_at: ctx.fetched_at,
                }),
                Err(err) => {
                    warn!(source = %self.source(), url = %target.url, error = %err, "listing target failed");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) if pages.is_empty() && targets.len() == 1 => Err(err.into()),
            Some(_) if pages.is_empty() => Err(AdapterError::AllTargetsFailed(targets.len())),
            _ => Ok(pages),
        }
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<RawRecord>, AdapterError>;
}

/// Read a captured listing page from disk, typed by file extension.
pub fn load_fixture_page(
    path: impl AsRef<Path>,
    source: Source,
    url: &str,
    fetched_at: DateTime<Utc>,
) -> anyhow::Result<FetchedPage> {
    let path = path.as_ref();
    let body = std::fs::read(path).with_context(|| format!("reading fixture page {}", path.display()))?;
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html",
        _ => "application/octet-stream",
    };
    Ok(FetchedPage {
        source,
        url: url.to_string(),
        content_type: content_type.to_string(),
        body,
        fetched_at,
    })
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(element: &ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|sel| {
        element
            .select(sel)
            .find_map(|n| text_or_none(&n.text().collect::<String>()))
    })
}

fn first_href(element: &ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    if let Some(href) = element.value().attr("href").and_then(text_or_none) {
        return Some(href);
    }
    selectors.iter().find_map(|sel| {
        element
            .select(sel)
            .find_map(|n| n.value().attr("href").and_then(text_or_none))
    })
}

/// Resolve `href` against the page url; unresolvable links are passed through
/// untouched so the normalizer reports them.
fn absolute_url(base: &str, href: &str) -> String {
    match Url::parse(base).and_then(|b| b.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
struct CardLayout {
    card: &'static str,
    title: &'static [&'static str],
    company: &'static [&'static str],
    location: &'static [&'static str],
    link: &'static [&'static str],
}

const LINKEDIN_LAYOUT: CardLayout = CardLayout {
    card: ".base-card",
    title: &[".base-search-card__title"],
    company: &[".base-search-card__subtitle"],
    location: &[".job-search-card__location"],
    link: &["a.base-card__full-link", "a[href]"],
};

const INDEED_LAYOUT: CardLayout = CardLayout {
    card: "td.resultContent",
    title: &["h2 span[title]", "h2 span"],
    company: &[".companyName", "[data-testid=\"company-name\"]"],
    location: &[".companyLocation", "[data-testid=\"text-location\"]"],
    link: &["h2 a[href]", "a[href]"],
};

fn compile(list: &[&str]) -> Result<Vec<Selector>, AdapterError> {
    list.iter().map(|css| selector(css)).collect()
}

/// Search-results page made of repeated cards, one posting per card.
#[derive(Debug, Clone, Copy)]
struct HtmlCardAdapter {
    source: Source,
    layout: CardLayout,
}

impl HtmlCardAdapter {
    fn parse_cards(&self, page: &FetchedPage) -> Result<Vec<RawRecord>, AdapterError> {
        let card = selector(self.layout.card)?;
        let title = compile(self.layout.title)?;
        let company = compile(self.layout.company)?;
        let location = compile(self.layout.location)?;
        let link = compile(self.layout.link)?;

        let document = Html::parse_document(&page.text());
        Ok(document
            .select(&card)
            .map(|el| RawRecord {
                title: first_text(&el, &title),
                company: first_text(&el, &company),
                location: first_text(&el, &location),
                url: first_href(&el, &link).map(|href| absolute_url(&page.url, &href)),
            })
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for HtmlCardAdapter {
    fn source(&self) -> Source {
        self.source
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<RawRecord>, AdapterError> {
        self.parse_cards(page)
    }
}

#[derive(Debug, Deserialize)]
struct InfoJobsOfferList {
    #[serde(default)]
    offers: Vec<InfoJobsOffer>,
}

#[derive(Debug, Deserialize)]
struct InfoJobsOffer {
    title: Option<String>,
    author: Option<InfoJobsAuthor>,
    city: Option<String>,
    province: Option<InfoJobsValue>,
    teleworking: Option<InfoJobsValue>,
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfoJobsAuthor {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfoJobsValue {
    value: Option<String>,
}

/// InfoJobs offer search API (JSON). Requires API credentials for live use.
#[derive(Debug, Clone, Default)]
struct InfoJobsApiAdapter {
    authorization: Option<String>,
}

impl InfoJobsOffer {
    fn location(&self) -> Option<String> {
        let place = self
            .city
            .as_deref()
            .and_then(text_or_none)
            .or_else(|| self.province.as_ref()?.value.as_deref().and_then(text_or_none));
        let mode = self
            .teleworking
            .as_ref()
            .and_then(|t| t.value.as_deref())
            .and_then(text_or_none);
        match (place, mode) {
            (Some(place), Some(mode)) => Some(format!("{place} ({mode})")),
            (place, mode) => place.or(mode),
        }
    }
}

#[async_trait]
impl SourceAdapter for InfoJobsApiAdapter {
    fn source(&self) -> Source {
        Source::InfoJobs
    }

    fn request_headers(&self) -> Result<HeaderMap, AdapterError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(auth) = &self.authorization {
            let value = HeaderValue::from_str(auth).map_err(|_| AdapterError::Header("Authorization"))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<RawRecord>, AdapterError> {
        let list: InfoJobsOfferList =
            serde_json::from_slice(&page.body).map_err(|source| AdapterError::Json {
                url: page.url.clone(),
                source,
            })?;
        Ok(list
            .offers
            .into_iter()
            .map(|offer| RawRecord {
                location: offer.location(),
                title: offer.title.as_deref().and_then(text_or_none),
                company: offer
                    .author
                    .as_ref()
                    .and_then(|a| a.name.as_deref())
                    .and_then(text_or_none),
                url: offer
                    .link
                    .as_deref()
                    .and_then(text_or_none)
                    .map(|href| absolute_url(&page.url, &href)),
            })
            .collect())
    }
}

pub fn linkedin_adapter() -> impl SourceAdapter {
    HtmlCardAdapter {
        source: Source::LinkedIn,
        layout: LINKEDIN_LAYOUT,
    }
}

pub fn indeed_adapter() -> impl SourceAdapter {
    HtmlCardAdapter {
        source: Source::Indeed,
        layout: INDEED_LAYOUT,
    }
}

pub fn infojobs_adapter(authorization: Option<String>) -> impl SourceAdapter {
    InfoJobsApiAdapter { authorization }
}

pub fn adapter_for_source(source: Source, settings: &AdapterSettings) -> Box<dyn SourceAdapter> {
    match source {
        Source::LinkedIn => Box::new(linkedin_adapter()),
        Source::Indeed => Box::new(indeed_adapter()),
        Source::InfoJobs => Box::new(infojobs_adapter(settings.authorization.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).single().unwrap()
    }

    fn html_page(source: Source, url: &str, html: &str) -> FetchedPage {
        FetchedPage {
            source,
            url: url.to_string(),
            content_type: "text/html".into(),
            body: html.as_bytes().to_vec(),
            fetched_at: ts(),
        }
    }

    #[test]
    fn card_without_title_keeps_other_fields() {
        let page = html_page(
            Source::LinkedIn,
            "https://www.linkedin.com/jobs/search/",
            r#"<ul><li><div class="base-card">
                 <a class="base-card__full-link" href="/jobs/view/42?trk=x"></a>
                 <h4 class="base-search-card__subtitle"> Acme </h4>
               </div></li></ul>"#,
        );
        let records = linkedin_adapter().parse_listing(&page).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, None);
        assert_eq!(records[0].company.as_deref(), Some("Acme"));
        assert_eq!(records[0].location, None);
        assert_eq!(
            records[0].url.as_deref(),
            Some("https://www.linkedin.com/jobs/view/42?trk=x")
        );
    }

    #[test]
    fn page_without_cards_is_empty_not_an_error() {
        let page = html_page(Source::Indeed, "https://es.indeed.com/jobs", "<html><body>captcha</body></html>");
        assert!(indeed_adapter().parse_listing(&page).unwrap().is_empty());
    }

    #[test]
    fn invalid_json_is_an_adapter_error() {
        let page = FetchedPage {
            source: Source::InfoJobs,
            url: "https://api.infojobs.net/api/7/offer".into(),
            content_type: "application/json".into(),
            body: b"<html>unauthorized</html>".to_vec(),
            fetched_at: ts(),
        };
        assert!(matches!(
            infojobs_adapter(None).parse_listing(&page),
            Err(AdapterError::Json { .. })
        ));
    }

    #[test]
    fn infojobs_sends_authorization_when_configured() {
        let headers = infojobs_adapter(Some("Basic abc123".into())).request_headers().unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Basic abc123");

        let bad = infojobs_adapter(Some("Basic \n".into())).request_headers();
        assert!(matches!(bad, Err(AdapterError::Header("Authorization"))));
    }

    #[test]
    fn registry_covers_every_source() {
        let settings = AdapterSettings::default();
        for source in Source::ALL {
            assert_eq!(adapter_for_source(source, &settings).source(), source);
        }
    }
}
