//! SQLite report repository for streakboard.

use std::cmp::Reverse;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use streakboard_core::StoredReport;
use thiserror::Error;
use tracing::{debug, info};

static MIGRATOR: Migrator = sqlx::migrate!();

const INSERT_OR_IGNORE: &str = r#"
    INSERT OR IGNORE INTO reports
        (message_id, subject, date, xp, minutes, lessons, streak)
    VALUES (?, ?, ?, ?, ?, ?, ?)
"#;

const SELECT_ALL: &str = r#"
    SELECT message_id, subject, date, xp, minutes, lessons, streak
      FROM reports
     ORDER BY rowid
"#;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Deduplicated store of weekly reports keyed by mailbox message id.
///
/// Rows are only ever inserted; an insert whose key already exists is a no-op.
#[derive(Debug, Clone)]
pub struct ReportRepository {
    pool: SqlitePool,
}

impl ReportRepository {
    /// Connect without touching the schema. A single pooled connection keeps
    /// every read and write serialized, which also keeps `sqlite::memory:`
    /// databases alive for the lifetime of the repository.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Connect and bring the schema up to date.
    pub async fn open(database_url: &str) -> Result<Self, StorageError> {
        let repo = Self::connect(database_url).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::open("sqlite::memory:").await
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        MIGRATOR.run(&self.pool).await?;
        debug!("reports schema up to date");
        Ok(())
    }

    /// Insert one report; `false` when the message id was already stored.
    pub async fn insert(&self, report: &StoredReport) -> Result<bool, StorageError> {
        let result = bind_report(sqlx::query(INSERT_OR_IGNORE), report)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert-or-ignore every report inside one transaction and return how
    /// many rows were new. A failure rolls the whole call back, so rows
    /// committed by earlier calls are never touched.
    pub async fn insert_bulk(&self, reports: &[StoredReport]) -> Result<usize, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for report in reports {
            let result = bind_report(sqlx::query(INSERT_OR_IGNORE), report)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                inserted += 1;
            } else {
                debug!(message_id = %report.message_id, "report already stored");
            }
        }
        tx.commit().await?;
        info!(offered = reports.len(), inserted, "bulk insert committed");
        Ok(inserted)
    }

    /// Every stored report, newest `date` first. Equal dates keep insertion
    /// order; rows with an unparseable date come last.
    pub async fn get_all(&self) -> Result<Vec<StoredReport>, StorageError> {
        let rows = sqlx::query(SELECT_ALL).fetch_all(&self.pool).await?;
        let mut reports = rows
            .iter()
            .map(row_to_report)
            .collect::<Result<Vec<_>, _>>()?;
        reports.sort_by_key(|r| Reverse(parse_report_date(&r.date)));
        Ok(reports)
    }

    pub async fn count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM reports")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }

    /// Raw `date` of the chronologically latest report.
    pub async fn latest_date(&self) -> Result<Option<String>, StorageError> {
        let rows = sqlx::query("SELECT date FROM reports ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        let dates = rows
            .iter()
            .map(|row| row.try_get::<String, _>("date"))
            .collect::<Result<Vec<_>, _>>()?;

        let mut latest: Option<(DateTime<Utc>, &String)> = None;
        for date in &dates {
            if let Some(parsed) = parse_report_date(date) {
                if latest.map_or(true, |(best, _)| parsed > best) {
                    latest = Some((parsed, date));
                }
            }
        }
        Ok(latest
            .map(|(_, date)| date.clone())
            .or_else(|| dates.first().cloned()))
    }
}

fn bind_report<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    report: &'q StoredReport,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(report.message_id.as_str())
        .bind(report.subject.as_str())
        .bind(report.date.as_str())
        .bind(i64::from(report.xp))
        .bind(i64::from(report.minutes))
        .bind(i64::from(report.lessons))
        .bind(i64::from(report.streak))
}

fn row_to_report(row: &SqliteRow) -> Result<StoredReport, sqlx::Error> {
    Ok(StoredReport {
        message_id: row.try_get("message_id")?,
        subject: row.try_get("subject")?,
        date: row.try_get("date")?,
        xp: metric_column(row, "xp")?,
        minutes: metric_column(row, "minutes")?,
        lessons: metric_column(row, "lessons")?,
        streak: metric_column(row, "streak")?,
    })
}

fn metric_column(row: &SqliteRow, column: &str) -> Result<u32, sqlx::Error> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

/// Parse a mail `Date` header for ordering.
///
/// RFC 2822 first; then, with the day-of-week and any trailing comment
/// removed, a few looser layouts seen in real headers.
pub fn parse_report_date(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    let candidate = strip_trailing_comment(strip_day_of_week(trimmed));
    for fmt in ["%d %b %Y %H:%M:%S %z", "%d %b %Y %H:%M %z"] {
        if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(candidate, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%d %b %Y %H:%M:%S", "%d %b %Y %H:%M"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(candidate, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    None
}

fn strip_day_of_week(s: &str) -> &str {
    match s.split_once(',') {
        Some((dow, rest)) if dow.len() == 3 && dow.chars().all(|c| c.is_ascii_alphabetic()) => {
            rest.trim_start()
        }
        _ => s,
    }
}

fn strip_trailing_comment(s: &str) -> &str {
    match s.rfind('(') {
        Some(idx) if s.ends_with(')') => s[..idx].trim_end(),
        _ => s,
    }
}
