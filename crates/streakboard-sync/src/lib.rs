//! Weekly report classification, metric extraction and sync orchestration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use streakboard_adapters::{
    extract_body, BackoffPolicy, FixtureMailbox, GmailMailbox, HttpClientConfig, HttpFetcher,
    Mailbox, MailboxError, SessionProvider, StaticSession, TokenFileSession,
};
use streakboard_core::{ExtractedReport, Metric, Metrics, RawMessage, StoredReport};
use streakboard_storage::ReportRepository;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_SEARCH_QUERY: &str = r#"from:duolingo "今週の進捗はいかに""#;

/// Subject phrases that identify a weekly report without looking at the body.
pub const WEEKLY_SUBJECT_MARKERS: [&str; 5] = [
    "週間レポート",
    "ウィークリーレポート",
    "Weekly Progress",
    "進捗をチェック",
    "成果が積み重なって",
];

/// Distinct body signals that must co-occur before a body alone classifies
/// a message as a weekly report.
pub const CLASSIFICATION_QUORUM: usize = 3;

static REPORT_SIGNALS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\d+XP",
        r"\d+分",
        r"レッスン\s*\d+回",
        r"\d+日連続",
        r"Weekly Progress",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

// `\d` is any Unicode decimal digit, so full-width figures count too.
static METRIC_PATTERNS: LazyLock<Vec<(Metric, Regex)>> = LazyLock::new(|| {
    [
        (Metric::Xp, r"(\d+)XP"),
        (Metric::Minutes, r"(\d+)分"),
        (Metric::Lessons, r"レッスン\s*(\d+)回"),
        (Metric::Streak, r"(\d+)日連続"),
    ]
    .into_iter()
    .map(|(metric, pattern)| (metric, Regex::new(pattern).expect("valid regex")))
    .collect()
});

static DECIMAL_DIGIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d$").expect("valid regex"));

fn is_decimal_digit(c: char) -> bool {
    let mut buf = [0u8; 4];
    DECIMAL_DIGIT.is_match(c.encode_utf8(&mut buf))
}

/// Value of a Unicode decimal digit. Decimal digits are assigned in
/// contiguous ascending runs of ten, so the value is the offset from the
/// start of the run, modulo ten.
fn decimal_digit_value(c: char) -> Option<u32> {
    if let Some(value) = c.to_digit(10) {
        return Some(value);
    }
    if !is_decimal_digit(c) {
        return None;
    }
    let run_offset = (1u32..)
        .map_while(|back| (c as u32).checked_sub(back).and_then(char::from_u32))
        .take_while(|prev| is_decimal_digit(*prev))
        .count();
    u32::try_from(run_offset % 10).ok()
}

/// Parse a run of decimal digits of any script; `None` on overflow.
fn parse_decimal(digits: &str) -> Option<u32> {
    digits.chars().try_fold(0u32, |acc, c| {
        acc.checked_mul(10)?.checked_add(decimal_digit_value(c)?)
    })
}

/// Number of distinct body signals present; each signal votes at most once.
pub fn report_signal_votes(body: &str) -> usize {
    REPORT_SIGNALS.iter().filter(|re| re.is_match(body)).count()
}

/// Subject markers short-circuit; otherwise the body must carry at least
/// [`CLASSIFICATION_QUORUM`] of the five report signals.
pub fn is_weekly_report(subject: &str, body: &str) -> bool {
    if WEEKLY_SUBJECT_MARKERS.iter().any(|marker| subject.contains(marker)) {
        return true;
    }
    report_signal_votes(body) >= CLASSIFICATION_QUORUM
}

/// Capture the first occurrence of each metric. `None` when nothing matched.
///
/// A first occurrence too large for `u32` leaves that metric out.
pub fn extract_metrics(body: &str) -> Option<Metrics> {
    let metrics = METRIC_PATTERNS
        .iter()
        .filter_map(|(metric, re)| {
            let digits = re.captures(body)?.get(1)?.as_str();
            parse_decimal(digits).map(|value| (*metric, value))
        })
        .collect::<Metrics>();
    (!metrics.is_empty()).then_some(metrics)
}

/// What the pipeline made of one fetched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Report(ExtractedReport),
    NotAReport,
    NoMetrics,
}

/// Body extraction → classification → metric extraction for one message.
pub fn process_message(message: &RawMessage) -> MessageOutcome {
    let subject = message.subject();
    let body = extract_body(&message.payload);
    if !is_weekly_report(subject, &body) {
        return MessageOutcome::NotAReport;
    }
    match extract_metrics(&body) {
        Some(metrics) => MessageOutcome::Report(ExtractedReport {
            message_id: message.id.clone(),
            subject: subject.to_string(),
            date: message.date().to_string(),
            metrics,
        }),
        None => MessageOutcome::NoMetrics,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxKind {
    Gmail,
    Fixtures,
}

impl MailboxKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gmail" => Some(Self::Gmail),
            "fixtures" | "fixture" => Some(Self::Fixtures),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub mailbox: MailboxKind,
    pub fixtures_dir: PathBuf,
    pub token_file: PathBuf,
    pub access_token: Option<String>,
    pub search_queries: Vec<String>,
    pub max_results: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_retries: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://streakboard.db".to_string(),
            mailbox: MailboxKind::Gmail,
            fixtures_dir: PathBuf::from("./fixtures/mailbox"),
            token_file: PathBuf::from("token.json"),
            access_token: None,
            search_queries: vec![DEFAULT_SEARCH_QUERY.to_string()],
            max_results: 20,
            user_agent: "streakboard/0.1".to_string(),
            http_timeout_secs: 20,
            fetch_retries: BackoffPolicy::default().max_retries,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            mailbox: std::env::var("STREAKBOARD_MAILBOX")
                .ok()
                .and_then(|v| MailboxKind::parse(&v))
                .unwrap_or(defaults.mailbox),
            fixtures_dir: std::env::var("STREAKBOARD_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.fixtures_dir),
            token_file: std::env::var("STREAKBOARD_TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.token_file),
            access_token: std::env::var("STREAKBOARD_ACCESS_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            search_queries: std::env::var("STREAKBOARD_SEARCH_QUERIES")
                .ok()
                .map(|v| parse_queries(&v))
                .filter(|q| !q.is_empty())
                .unwrap_or(defaults.search_queries),
            max_results: env_parse("STREAKBOARD_MAX_RESULTS").unwrap_or(defaults.max_results),
            user_agent: std::env::var("STREAKBOARD_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("STREAKBOARD_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            fetch_retries: env_parse("STREAKBOARD_FETCH_RETRIES").unwrap_or(defaults.fetch_retries),
            scheduler_enabled: std::env::var("STREAKBOARD_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_queries(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Build the configured mailbox collaborator.
pub fn build_mailbox(config: &SyncConfig) -> Result<Box<dyn Mailbox>> {
    match config.mailbox {
        MailboxKind::Fixtures => {
            let mailbox = FixtureMailbox::load_dir(&config.fixtures_dir)
                .with_context(|| format!("loading fixtures from {}", config.fixtures_dir.display()))?;
            Ok(Box::new(mailbox))
        }
        MailboxKind::Gmail => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                backoff: BackoffPolicy {
                    max_retries: config.fetch_retries,
                    ..Default::default()
                },
            })?;
            let sessions: Box<dyn SessionProvider> = match &config.access_token {
                Some(token) => Box::new(StaticSession::new(token.clone())),
                None => Box::new(TokenFileSession::new(config.token_file.clone())),
            };
            Ok(Box::new(GmailMailbox::new(http, sessions)))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub fetch_failures: usize,
    pub rejected: usize,
    pub without_metrics: usize,
    pub extracted: usize,
    pub new_records: usize,
    pub total_records: u64,
}

/// One sync pass: search → fetch → extract → classify → extract metrics →
/// bulk insert. Passes are serialized; messages are handled one at a time.
pub struct SyncPipeline {
    mailbox: Box<dyn Mailbox>,
    repository: ReportRepository,
    search_queries: Vec<String>,
    max_results: usize,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(mailbox: Box<dyn Mailbox>, repository: ReportRepository) -> Self {
        Self {
            mailbox,
            repository,
            search_queries: vec![DEFAULT_SEARCH_QUERY.to_string()],
            max_results: 20,
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_search(mut self, queries: Vec<String>, max_results: usize) -> Self {
        self.search_queries = queries;
        self.max_results = max_results;
        self
    }

    pub fn repository(&self) -> &ReportRepository {
        &self.repository
    }

    pub async fn run_once(&self) -> Result<SyncSummary> {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, mailbox = self.mailbox.name());
        self.run_locked(run_id).instrument(span).await
    }

    async fn run_locked(&self, run_id: Uuid) -> Result<SyncSummary> {
        let started_at = Utc::now();
        let candidates = self.search_candidates().await?;
        info!(candidates = candidates.len(), "mailbox search complete");

        let mut fetch_failures = 0usize;
        let mut rejected = 0usize;
        let mut without_metrics = 0usize;
        let mut batch = Vec::new();

        for message_id in &candidates {
            let message = match self.mailbox.fetch(message_id).await {
                Ok(message) => message,
                Err(err @ MailboxError::Unauthorized(_)) => {
                    return Err(err).with_context(|| format!("fetching message {message_id}"));
                }
                Err(err) => {
                    warn!(%message_id, error = %err, "skipping message that could not be fetched");
                    fetch_failures += 1;
                    continue;
                }
            };

            match process_message(&message) {
                MessageOutcome::Report(report) => {
                    info!(%message_id, subject = %report.subject, metrics = ?report.metrics, "weekly report extracted");
                    batch.push(StoredReport::from_extracted(&report));
                }
                MessageOutcome::NotAReport => {
                    debug!(%message_id, subject = message.subject(), "not a weekly report");
                    rejected += 1;
                }
                MessageOutcome::NoMetrics => {
                    warn!(%message_id, subject = message.subject(), "weekly report without recognizable metrics");
                    without_metrics += 1;
                }
            }
        }

        let extracted = batch.len();
        let new_records = self
            .repository
            .insert_bulk(&batch)
            .await
            .context("persisting extracted reports")?;
        let total_records = self.repository.count().await.context("counting stored reports")?;

        let summary = SyncSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            candidates: candidates.len(),
            fetch_failures,
            rejected,
            without_metrics,
            extracted,
            new_records,
            total_records,
        };
        info!(new_records, total_records, extracted, "sync complete");
        Ok(summary)
    }

    /// Candidate ids across every query, first occurrence order, no repeats.
    async fn search_candidates(&self) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for query in &self.search_queries {
            let found = self
                .mailbox
                .search(query, self.max_results)
                .await
                .with_context(|| format!("searching mailbox with {query:?}"))?;
            debug!(query = %query, found = found.len(), "search results");
            ids.extend(found.into_iter().filter(|id| seen.insert(id.clone())));
        }
        Ok(ids)
    }
}

/// Open the repository and mailbox described by `config`.
pub async fn pipeline_from_config(config: &SyncConfig) -> Result<SyncPipeline> {
    let repository = ReportRepository::open(&config.database_url)
        .await
        .with_context(|| format!("opening report database {}", config.database_url))?;
    let mailbox = build_mailbox(config)?;
    Ok(SyncPipeline::new(mailbox, repository)
        .with_search(config.search_queries.clone(), config.max_results))
}

/// Cron-driven sync passes, when enabled. The returned scheduler is
/// already started; keep it alive for as long as jobs should fire.
pub async fn maybe_start_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    new_records = summary.new_records,
                    total_records = summary.total_records,
                    "scheduled sync finished"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduled sync enabled");
    Ok(Some(sched))
}
