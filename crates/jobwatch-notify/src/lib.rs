//! Digest delivery: Telegram Bot API, stdout for dry runs, and the
//! long-polling bot that runs the pipeline on request.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jobwatch_sync::{Notifier, NotifyError, Pipeline, RunReport};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "jobwatch-notify";

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Per-message budget, kept under Telegram's 4096 character cap.
pub const MAX_MESSAGE_CHARS: usize = 4000;

pub const HELP_MESSAGE: &str = "Send /hoy or /today to search for new job postings.";

const RUN_FAILED_MESSAGE: &str = "❌ The search failed. Check the logs for details.";
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);
const POLL_ERROR_DELAY: Duration = Duration::from_secs(5);

/// Split a digest into chunks of at most `max_chars` characters, cutting at
/// blank-line block boundaries where possible.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for block in text.split_inclusive("\n\n") {
        let block_len = block.chars().count();
        if current_len + block_len > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if block_len <= max_chars {
            current.push_str(block);
            current_len += block_len;
            continue;
        }
        for ch in block.chars() {
            if current_len == max_chars {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current.push(ch);
            current_len += 1;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .map(|chunk| chunk.trim_end().to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    description: Option<String>,
    result: Option<T>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    token: String,
    chat_id: i64,
    timeout: Duration,
    max_retries: u8,
    max_chars: usize,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_id: i64) -> Self {
        Self {
            client: Client::new(),
            api_base: TELEGRAM_API_BASE.to_string(),
            token: token.into(),
            chat_id,
            timeout: Duration::from_secs(10),
            max_retries: 3,
            max_chars: MAX_MESSAGE_CHARS,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    // Carries the token; never log it.
    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.token,
            method
        )
    }

    fn backoff(&self, attempt: u8) -> Duration {
        Duration::from_millis(500u64 << (attempt.saturating_sub(1)).min(6))
    }

    /// Deliver `text` to an arbitrary chat, one request per chunk.
    pub async fn send_to(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        let chunks = split_message(text, self.max_chars);
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            self.send_chunk(chat_id, chunk).await?;
            debug!(chunk = index + 1, total, "telegram chunk delivered");
        }
        Ok(())
    }

    async fn send_chunk(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        let payload = SendMessage {
            chat_id,
            text,
            parse_mode: "Markdown",
            disable_web_page_preview: true,
        };

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(self.method_url("sendMessage"))
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            let delay = match res {
                Ok(rsp) => {
                    let status = rsp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    let body = rsp.json::<TelegramResponse<serde_json::Value>>().await.ok();
                    let description = body
                        .as_ref()
                        .and_then(|b| b.description.clone())
                        .unwrap_or_else(|| status.to_string());
                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if !retryable || attempt >= self.max_retries {
                        return Err(NotifyError::Rejected(format!("{status}: {description}")));
                    }
                    body.and_then(|b| b.parameters)
                        .and_then(|p| p.retry_after)
                        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
                        .unwrap_or_else(|| self.backoff(attempt))
                }
                Err(err) => {
                    let err = err.without_url();
                    if attempt >= self.max_retries {
                        return Err(NotifyError::Transport(err.to_string()));
                    }
                    warn!(attempt, error = %err, "telegram request failed");
                    self.backoff(attempt)
                }
            };
            warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying telegram sendMessage");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        self.send_to(self.chat_id, text).await
    }
}

/// Prints the digest instead of sending it.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutNotifier;

#[async_trait]
impl Notifier for StdoutNotifier {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        println!("{text}");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    Today,
    Help,
}

/// Recognise `/hoy`, `/today`, `/start` and `/help`, with or without a `@botname` suffix.
pub fn parse_command(text: &str) -> Option<BotCommand> {
    let first = text.split_whitespace().next()?;
    let name = first.strip_prefix('/')?;
    let name = name.split('@').next().unwrap_or(name);
    match name.to_ascii_lowercase().as_str() {
        "hoy" | "today" => Some(BotCommand::Today),
        "start" | "help" => Some(BotCommand::Help),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRequest {
    pub chat_id: i64,
    pub command: BotCommand,
}

/// Extract a command from an update sent by `allowed_user`; anything else is ignored.
pub fn command_from_update(update: &Update, allowed_user: i64) -> Option<CommandRequest> {
    let message = update.message.as_ref()?;
    let command = parse_command(message.text.as_deref()?)?;
    let sender = message.from.as_ref().map(|u| u.id);
    if sender != Some(allowed_user) {
        warn!(update_id = update.update_id, sender = ?sender, "ignoring command from unauthorized user");
        return None;
    }
    Some(CommandRequest {
        chat_id: message.chat.id,
        command,
    })
}

/// Routes a run's digest back to the chat that asked for it.
struct ChatReply<'a> {
    telegram: &'a TelegramNotifier,
    chat_id: i64,
}

#[async_trait]
impl<'a> Notifier for ChatReply<'a> {
    fn name(&self) -> &'static str {
        "telegram-reply"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        self.telegram.send_to(self.chat_id, text).await
    }
}

pub struct TelegramBot {
    telegram: TelegramNotifier,
    pipeline: Arc<Pipeline>,
    allowed_user: i64,
    run_lock: Mutex<()>,
    poll_timeout_secs: u64,
}

impl TelegramBot {
    pub fn new(telegram: TelegramNotifier, pipeline: Arc<Pipeline>, allowed_user: i64) -> Self {
        Self {
            telegram,
            pipeline,
            allowed_user,
            run_lock: Mutex::new(()),
            poll_timeout_secs: 30,
        }
    }

    pub fn with_poll_timeout(mut self, secs: u64) -> Self {
        self.poll_timeout_secs = secs;
        self
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let rsp = self
            .telegram
            .client
            .get(self.telegram.method_url("getUpdates"))
            .query(&[("offset", offset), ("timeout", self.poll_timeout_secs as i64)])
            .timeout(Duration::from_secs(self.poll_timeout_secs + 10))
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("getUpdates request failed")?;
        let status = rsp.status();
        let body: TelegramResponse<Vec<Update>> = rsp
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("decoding getUpdates response ({status})"))?;
        if !body.ok {
            bail!(
                "getUpdates rejected ({status}): {}",
                body.description.unwrap_or_default()
            );
        }
        Ok(body.result.unwrap_or_default())
    }

    /// Answer one command. Runs are serialized; a request arriving mid-run waits.
    pub async fn handle(&self, request: CommandRequest) -> Result<Option<RunReport>> {
        match request.command {
            BotCommand::Help => {
                self.telegram
                    .send_to(request.chat_id, HELP_MESSAGE)
                    .await
                    .context("sending help")?;
                Ok(None)
            }
            BotCommand::Today => {
                let _guard = self.run_lock.lock().await;
                let reply = ChatReply {
                    telegram: &self.telegram,
                    chat_id: request.chat_id,
                };
                match self.pipeline.run_once(&reply).await {
                    Ok(report) => {
                        info!(chat_id = request.chat_id, "{}", report.summary_line());
                        Ok(Some(report))
                    }
                    Err(err) => {
                        if let Err(notify_err) =
                            self.telegram.send_to(request.chat_id, RUN_FAILED_MESSAGE).await
                        {
                            warn!(error = %notify_err, "could not report failure to chat");
                        }
                        Err(err.into())
                    }
                }
            }
        }
    }

    /// Poll for commands until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut offset = 0i64;
        info!(allowed_user = self.allowed_user, "telegram bot polling for commands");
        loop {
            let polled = tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; bot stopping");
                    return Ok(());
                }
                polled = self.get_updates(offset) => polled,
            };
            let updates = match polled {
                Ok(updates) => updates,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "polling failed; backing off");
                    tokio::time::sleep(POLL_ERROR_DELAY).await;
                    continue;
                }
            };
            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(request) = command_from_update(&update, self.allowed_user) else {
                    continue;
                };
                if let Err(err) = self.handle(request).await {
                    error!(error = %format!("{err:#}"), "command failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwatch_core::{Profile, NO_MATCHES_MESSAGE};
    use jobwatch_storage::HistoryStore;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok_body() -> serde_json::Value {
        json!({"ok": true, "result": {"message_id": 1}})
    }

    #[test]
    fn short_messages_are_not_split() {
        assert_eq!(split_message("hello", 10), ["hello"]);
    }

    #[test]
    fn split_prefers_block_boundaries() {
        let text = "header\n\nblock one\n\nblock two\n\n";
        let chunks = split_message(text, 20);
        assert_eq!(chunks, ["header\n\nblock one", "block two"]);
    }

    #[test]
    fn oversized_block_is_hard_split() {
        let text = "ééééééééé\n\nok";
        let chunks = split_message(text, 4);
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
        assert_eq!(chunks.concat().replace('\n', ""), "éééééééééok");
    }

    #[test]
    fn commands_are_parsed_with_optional_bot_suffix() {
        assert_eq!(parse_command("/hoy"), Some(BotCommand::Today));
        assert_eq!(parse_command("/today@jobwatch_bot please"), Some(BotCommand::Today));
        assert_eq!(parse_command("/HOY"), Some(BotCommand::Today));
        assert_eq!(parse_command("/start"), Some(BotCommand::Help));
        assert_eq!(parse_command("hoy"), None);
        assert_eq!(parse_command("/weather"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn commands_from_other_users_are_ignored() {
        let update: Update = serde_json::from_value(json!({
            "update_id": 7,
            "message": {"chat": {"id": 99}, "from": {"id": 42}, "text": "/hoy"}
        }))
        .unwrap();
        assert_eq!(
            command_from_update(&update, 42),
            Some(CommandRequest {
                chat_id: 99,
                command: BotCommand::Today
            })
        );
        assert_eq!(command_from_update(&update, 43), None);

        let no_text: Update = serde_json::from_value(json!({
            "update_id": 8,
            "message": {"chat": {"id": 99}, "from": {"id": 42}}
        }))
        .unwrap();
        assert_eq!(command_from_update(&no_text, 42), None);
    }

    #[tokio::test]
    async fn send_uses_markdown_without_link_previews() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottest-token/sendMessage"))
            .and(body_partial_json(json!({
                "chat_id": 42,
                "parse_mode": "Markdown",
                "disable_web_page_preview": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new("test-token", 42).with_api_base(server.uri());
        notifier.send("📢 *Job postings found:*").await.unwrap();
    }

    #[tokio::test]
    async fn long_digest_is_sent_in_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottest-token/sendMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(3)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new("test-token", 42)
            .with_api_base(server.uri())
            .with_max_chars(12);
        notifier.send("block one\n\nblock two\n\nblock six").await.unwrap();
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"ok": false, "description": "Bad Request: chat not found"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new("test-token", 42).with_api_base(server.uri());
        let err = notifier.send("hi").await.unwrap_err();
        assert!(matches!(err, NotifyError::Rejected(ref msg) if msg.contains("chat not found")));
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new("test-token", 42)
            .with_api_base(server.uri())
            .with_retries(2);
        assert!(matches!(
            notifier.send("hi").await,
            Err(NotifyError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn get_updates_decodes_messages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bottest-token/getUpdates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": [
                    {"update_id": 10, "message": {"chat": {"id": 5}, "from": {"id": 5}, "text": "/hoy"}},
                    {"update_id": 11}
                ]
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            Profile::default(),
            HistoryStore::new(dir.path().join("history.csv")),
            Vec::new(),
        );
        let telegram = TelegramNotifier::new("test-token", 5).with_api_base(server.uri());
        let bot = TelegramBot::new(telegram, Arc::new(pipeline), 5);

        let updates = bot.get_updates(0).await.unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].update_id, 10);
        assert!(updates[1].message.is_none());
    }

    #[tokio::test]
    async fn today_command_replies_with_a_fresh_digest() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottest-token/sendMessage"))
            .and(body_partial_json(json!({"chat_id": 77, "text": NO_MATCHES_MESSAGE})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            Profile::default(),
            HistoryStore::new(dir.path().join("history.csv")),
            Vec::new(),
        );
        let telegram = TelegramNotifier::new("test-token", 5).with_api_base(server.uri());
        let bot = TelegramBot::new(telegram, Arc::new(pipeline), 5);

        let report = bot
            .handle(CommandRequest {
                chat_id: 77,
                command: BotCommand::Today,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.persisted, 0);
        assert!(report.notify_error.is_none());
    }
}
