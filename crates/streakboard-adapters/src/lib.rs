//! Mailbox collaborator contracts, the retrying Gmail HTTP client, the
//! Gmail and fixture mailboxes, and message body flattening.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use regex::Regex;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use streakboard_core::{MessagePart, RawMessage};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Gmail emits base64url both with and without trailing `=` padding.
const BODY_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox session unavailable: {0}")]
    Session(String),
    #[error("mail provider rejected the access token, re-authenticate: {0}")]
    Unauthorized(String),
    #[error("mailbox search {query:?} failed: {source}")]
    Search { query: String, source: FetchError },
    #[error("fetching message {message_id} failed: {source}")]
    Fetch {
        message_id: String,
        source: FetchError,
    },
    #[error("invalid mailbox url: {0}")]
    Url(String),
    #[error("message {0} not found")]
    NotFound(String),
    #[error("fixture {path}: {reason}")]
    Fixture { path: PathBuf, reason: String },
}

/// Authenticated handle on the mail provider.
#[derive(Clone)]
pub struct MailboxSession {
    pub access_token: String,
}

impl fmt::Debug for MailboxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxSession")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Source of mailbox sessions. Token storage and refresh live behind this.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_mailbox_session(&self) -> Result<MailboxSession, MailboxError>;
}

/// A fixed access token, e.g. from `STREAKBOARD_ACCESS_TOKEN`.
pub struct StaticSession {
    token: String,
}

impl StaticSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn get_mailbox_session(&self) -> Result<MailboxSession, MailboxError> {
        Ok(MailboxSession {
            access_token: self.token.clone(),
        })
    }
}

/// Reads the access token from an authorized-user token file
/// (`{"token": ...}` or `{"access_token": ...}`) on every session request.
pub struct TokenFileSession {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    token: Option<String>,
    access_token: Option<String>,
}

impl TokenFileSession {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SessionProvider for TokenFileSession {
    async fn get_mailbox_session(&self) -> Result<MailboxSession, MailboxError> {
        let file: TokenFile = read_json_file(&self.path)
            .map_err(|err| MailboxError::Session(err.to_string()))?;
        file.token
            .or(file.access_token)
            .filter(|t| !t.trim().is_empty())
            .map(|access_token| MailboxSession { access_token })
            .ok_or_else(|| {
                MailboxError::Session(format!("{} holds no access token", self.path.display()))
            })
    }
}

/// The mailbox collaborator: query for candidate ids, then fetch each one.
#[async_trait]
pub trait Mailbox: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>, MailboxError>;

    async fn fetch(&self, message_id: &str) -> Result<RawMessage, MailboxError>;
}

/// How a mail provider response status is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusAction {
    Retry,
    Reauthenticate,
    Fail,
}

fn status_action(status: StatusCode) -> StatusAction {
    match status {
        StatusCode::UNAUTHORIZED => StatusAction::Reauthenticate,
        StatusCode::TOO_MANY_REQUESTS => StatusAction::Retry,
        s if s.is_server_error() => StatusAction::Retry,
        _ => StatusAction::Fail,
    }
}

/// Capped exponential backoff between attempts of one request.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Pause before retry number `retry` (0-based).
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(doublings))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to mail provider failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("access token rejected by {url}")]
    Unauthorized { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
}

/// Bearer-authenticated JSON GETs against the mail provider. Connect and
/// timeout errors, 429 and 5xx are retried; 401 is never retried.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building mail provider http client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let body = self.get_with_retry(url, access_token).await?;
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }

    async fn get_with_retry(&self, url: &str, access_token: &str) -> Result<Vec<u8>, FetchError> {
        let mut retry = 0usize;
        loop {
            let retries_left = retry < self.backoff.max_retries;
            let sent = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json")
                .bearer_auth(access_token)
                .send()
                .await;

            match sent {
                Ok(resp) if resp.status().is_success() => return Ok(resp.bytes().await?.to_vec()),
                Ok(resp) => {
                    let status = resp.status();
                    let url = resp.url().to_string();
                    match status_action(status) {
                        StatusAction::Reauthenticate => return Err(FetchError::Unauthorized { url }),
                        StatusAction::Retry if retries_left => {
                            warn!(%status, retry, "mail provider busy, retrying");
                        }
                        StatusAction::Retry | StatusAction::Fail => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url,
                            });
                        }
                    }
                }
                Err(err) if retries_left && (err.is_connect() || err.is_timeout()) => {
                    warn!(error = %err, retry, "mail provider unreachable, retrying");
                }
                Err(err) => return Err(FetchError::Request(err)),
            }

            tokio::time::sleep(self.backoff.delay_before_retry(retry)).await;
            retry += 1;
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessageList {
    #[serde(default)]
    messages: Vec<GmailMessageStub>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageStub {
    id: String,
}

/// Gmail REST mailbox for the authenticated user (`users/me`).
pub struct GmailMailbox {
    http: HttpFetcher,
    sessions: Box<dyn SessionProvider>,
    base_url: String,
}

impl GmailMailbox {
    pub fn new(http: HttpFetcher, sessions: Box<dyn SessionProvider>) -> Self {
        Self {
            http,
            sessions,
            base_url: GMAIL_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/users/me/messages", self.base_url)
    }
}

#[async_trait]
impl Mailbox for GmailMailbox {
    fn name(&self) -> &'static str {
        "gmail"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>, MailboxError> {
        let session = self.sessions.get_mailbox_session().await?;
        let max_results = max_results.to_string();
        let url = reqwest::Url::parse_with_params(
            &self.messages_url(),
            [("q", query), ("maxResults", max_results.as_str())],
        )
        .map_err(|err| MailboxError::Url(err.to_string()))?;

        let list: GmailMessageList = self
            .http
            .get_json(url.as_str(), &session.access_token)
            .await
            .map_err(|source| match source {
                FetchError::Unauthorized { url } => MailboxError::Unauthorized(url),
                source => MailboxError::Search {
                    query: query.to_string(),
                    source,
                },
            })?;
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn fetch(&self, message_id: &str) -> Result<RawMessage, MailboxError> {
        let session = self.sessions.get_mailbox_session().await?;
        let url = format!("{}/{}?format=full", self.messages_url(), message_id);
        self.http
            .get_json(&url, &session.access_token)
            .await
            .map_err(|source| match source {
                FetchError::Unauthorized { url } => MailboxError::Unauthorized(url),
                source => MailboxError::Fetch {
                    message_id: message_id.to_string(),
                    source,
                },
            })
    }
}

/// Offline mailbox over Gmail-format JSON messages.
///
/// Search ignores the query and yields every message in load order.
#[derive(Debug, Clone, Default)]
pub struct FixtureMailbox {
    messages: Vec<RawMessage>,
}

impl FixtureMailbox {
    pub fn from_messages(messages: Vec<RawMessage>) -> Self {
        Self { messages }
    }

    /// Load every `*.json` file of `dir`, sorted by file name. A missing
    /// directory is an empty mailbox.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, MailboxError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(Self::default());
        }
        let mut paths = fs::read_dir(dir)
            .map_err(|err| MailboxError::Fixture {
                path: dir.to_path_buf(),
                reason: err.to_string(),
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        paths.sort();

        let messages = paths
            .iter()
            .map(|path| load_message_file(path))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(dir = %dir.display(), count = messages.len(), "loaded fixture mailbox");
        Ok(Self { messages })
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl Mailbox for FixtureMailbox {
    fn name(&self) -> &'static str {
        "fixtures"
    }

    async fn search(&self, _query: &str, max_results: usize) -> Result<Vec<String>, MailboxError> {
        Ok(self
            .messages
            .iter()
            .take(max_results)
            .map(|m| m.id.clone())
            .collect())
    }

    async fn fetch(&self, message_id: &str) -> Result<RawMessage, MailboxError> {
        self.messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| MailboxError::NotFound(message_id.to_string()))
    }
}

/// Parse one Gmail-format JSON message file.
pub fn load_message_file(path: impl AsRef<Path>) -> Result<RawMessage, MailboxError> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, MailboxError> {
    let path = path.as_ref();
    let fixture_err = |reason: String| MailboxError::Fixture {
        path: path.to_path_buf(),
        reason,
    };
    let data = fs::read_to_string(path).map_err(|err| fixture_err(err.to_string()))?;
    serde_json::from_str(&data).map_err(|err| fixture_err(err.to_string()))
}

/// Flatten a payload tree into one plain-text string.
///
/// Depth-first, left to right. `text/plain` leaves are appended verbatim,
/// `text/html` leaves with tags replaced by a space and whitespace runs
/// collapsed. Other leaves, and leaves whose data does not decode, add
/// nothing. The result is trimmed.
pub fn extract_body(payload: &MessagePart) -> String {
    flatten_part(payload).trim().to_string()
}

fn flatten_part(part: &MessagePart) -> String {
    if let Some(children) = &part.parts {
        return children.iter().map(flatten_part).collect();
    }

    let mime_type = part.mime_type.as_deref().unwrap_or_default();
    if mime_type.eq_ignore_ascii_case("text/plain") {
        leaf_text(part).unwrap_or_default()
    } else if mime_type.eq_ignore_ascii_case("text/html") {
        leaf_text(part).map(|html| html_to_text(&html)).unwrap_or_default()
    } else {
        String::new()
    }
}

fn leaf_text(part: &MessagePart) -> Option<String> {
    let data = part.body.as_ref()?.data.as_deref()?;
    if data.is_empty() {
        return None;
    }
    decode_body_data(data)
}

/// base64url → UTF-8; `None` when either step fails.
pub fn decode_body_data(data: &str) -> Option<String> {
    let bytes = BODY_BASE64.decode(data.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Strip markup: every tag becomes a space, then whitespace runs collapse
/// to a single space.
pub fn html_to_text(html: &str) -> String {
    let untagged = HTML_TAG.replace_all(html, " ");
    WHITESPACE_RUN.replace_all(&untagged, " ").into_owned()
}
