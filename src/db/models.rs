//! Database model types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One down/up transition of a watched topic.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub topic: String,
    pub last_seen_before_timeout: DateTime<Utc>,
    /// `None` while the topic is still down.
    pub first_seen_after_timeout: Option<DateTime<Utc>>,
}

/// One run of the agent process.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRunEntry {
    pub start_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
}

/// Downtime of a single topic over a reporting window.
#[derive(Debug, Clone, Serialize)]
pub struct DowntimeReport {
    pub topic: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub down_seconds: i64,
    pub outages: usize,
    /// Fraction of the window the topic was publishing, in `[0, 1]`.
    pub availability: f64,
}
