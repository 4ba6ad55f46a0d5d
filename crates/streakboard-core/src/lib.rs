//! Core domain model for streakboard: mailbox messages, extracted weekly
//! reports and their persisted form.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One `name: value` header of a mailbox message part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

/// Encoded content of a leaf part. `data` is base64url, padded or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    pub size: Option<u64>,
    pub data: Option<String>,
    pub attachment_id: Option<String>,
}

/// Node of a message payload tree.
///
/// A node that carries `parts` is a container and its own body is never
/// read; any other node is a leaf identified by its MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub part_id: Option<String>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<MessageHeader>,
    pub body: Option<PartBody>,
    pub parts: Option<Vec<MessagePart>>,
}

impl MessagePart {
    pub fn is_container(&self) -> bool {
        self.parts.is_some()
    }

    /// First header whose name matches `name`, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn leaf(mime_type: &str, data: &str) -> Self {
        Self {
            mime_type: Some(mime_type.to_string()),
            body: Some(PartBody {
                size: Some(data.len() as u64),
                data: Some(data.to_string()),
                attachment_id: None,
            }),
            ..Default::default()
        }
    }

    pub fn container(mime_type: &str, parts: Vec<MessagePart>) -> Self {
        Self {
            mime_type: Some(mime_type.to_string()),
            parts: Some(parts),
            ..Default::default()
        }
    }
}

/// Full message as returned by the mailbox collaborator
/// (Gmail `users.messages.get?format=full` shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub snippet: Option<String>,
    #[serde(default)]
    pub payload: MessagePart,
}

impl RawMessage {
    /// `Subject` header, or the empty string when absent.
    pub fn subject(&self) -> &str {
        self.payload.header("Subject").unwrap_or_default()
    }

    /// Raw `Date` header, or the empty string when absent.
    pub fn date(&self) -> &str {
        self.payload.header("Date").unwrap_or_default()
    }
}

/// The four numeric fields a weekly report carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Xp,
    Minutes,
    Lessons,
    Streak,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Xp, Metric::Minutes, Metric::Lessons, Metric::Streak];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Xp => "xp",
            Metric::Minutes => "minutes",
            Metric::Lessons => "lessons",
            Metric::Streak => "streak",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recognized metrics of one report. Never zero-filled.
pub type Metrics = BTreeMap<Metric, u32>;

/// Classification + extraction result for one message. Only built when at
/// least one metric was recognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedReport {
    pub message_id: String,
    pub subject: String,
    pub date: String,
    pub metrics: Metrics,
}

/// Persisted report row, keyed by `message_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReport {
    pub message_id: String,
    pub subject: String,
    pub date: String,
    pub xp: u32,
    pub minutes: u32,
    pub lessons: u32,
    pub streak: u32,
}

impl StoredReport {
    /// Persistence formatting: metrics missing from the extraction become 0.
    pub fn from_extracted(report: &ExtractedReport) -> Self {
        let metric = |m: Metric| report.metrics.get(&m).copied().unwrap_or(0);
        Self {
            message_id: report.message_id.clone(),
            subject: report.subject.clone(),
            date: report.date.clone(),
            xp: metric(Metric::Xp),
            minutes: metric(Metric::Minutes),
            lessons: metric(Metric::Lessons),
            streak: metric(Metric::Streak),
        }
    }
}

/// Dashboard-facing row of the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub date: String,
    pub subject: String,
    pub xp: u32,
    pub minutes: u32,
    pub lessons: u32,
    pub streak: u32,
}

impl From<&StoredReport> for ReportRow {
    fn from(report: &StoredReport) -> Self {
        Self {
            date: report.date.clone(),
            subject: report.subject.clone(),
            xp: report.xp,
            minutes: report.minutes,
            lessons: report.lessons,
            streak: report.streak,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_report_zero_fills_missing_metrics() {
        let extracted = ExtractedReport {
            message_id: "m1".into(),
            subject: "Weekly Progress".into(),
            date: "Sat, 30 Aug 2025 05:00:37 +0000".into(),
            metrics: Metrics::from([(Metric::Xp, 120), (Metric::Streak, 9)]),
        };
        let stored = StoredReport::from_extracted(&extracted);
        assert_eq!(stored.xp, 120);
        assert_eq!(stored.minutes, 0);
        assert_eq!(stored.lessons, 0);
        assert_eq!(stored.streak, 9);
    }

    #[test]
    fn raw_message_reads_gmail_json() {
        let json = r#"{
            "id": "18a1",
            "threadId": "18a1",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "subject", "value": "Weekly Progress"},
                    {"name": "Date", "value": "Sun, 31 Aug 2025 05:00:37 +0000"}
                ],
                "body": {"size": 0},
                "parts": [{"mimeType": "text/plain", "body": {"size": 4, "data": "dGVzdA=="}}]
            }
        }"#;
        let msg: RawMessage = serde_json::from_str(json).expect("parse");
        assert_eq!(msg.subject(), "Weekly Progress");
        assert_eq!(msg.date(), "Sun, 31 Aug 2025 05:00:37 +0000");
        assert!(msg.payload.is_container());
        let leaf = &msg.payload.parts.as_ref().expect("parts")[0];
        assert!(!leaf.is_container());
        assert_eq!(leaf.body.as_ref().and_then(|b| b.data.as_deref()), Some("dGVzdA=="));
    }

    #[test]
    fn missing_headers_read_as_empty() {
        let msg = RawMessage {
            id: "x".into(),
            ..Default::default()
        };
        assert_eq!(msg.subject(), "");
        assert_eq!(msg.date(), "");
    }

    #[test]
    fn metric_serializes_lowercase() {
        let metrics = Metrics::from([(Metric::Lessons, 3)]);
        let json = serde_json::to_string(&metrics).expect("json");
        assert_eq!(json, r#"{"lessons":3}"#);
    }
}
