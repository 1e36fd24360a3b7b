use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Present,
    Absent,
    Unknown,
}

/// Latest known presence for one subject. One entry per subject is kept;
/// a newer successful cycle overwrites it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub subject_id: String,
    pub status: PresenceStatus,
    pub last_updated_at: DateTime<Utc>,
    pub source_cycle: u64,
}

/// What one fetch attempt produced. Lives for one cycle: logged, applied to
/// the cache, then dropped.
pub type PollResult = Result<FetchBatch, FetchError>;

#[derive(Debug)]
pub struct FetchBatch {
    pub snapshots: Vec<PresenceSnapshot>,
    /// Status of the roster response; per-subject cycles report the first
    /// successful response's status.
    pub http_status: u16,
    /// Subjects that failed inside an otherwise successful per-subject cycle.
    pub partial_failures: Vec<(String, FetchError)>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication rejected (HTTP {0}) - check the API key")]
    AuthRejected(u16),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("unexpected HTTP status {0}")]
    Unknown(u16),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout => "timeout",
            FetchError::Network(_) => "network",
            FetchError::AuthRejected(_) => "auth_rejected",
            FetchError::MalformedResponse(_) => "malformed_response",
            FetchError::Unknown(_) => "unknown",
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            FetchError::AuthRejected(status) | FetchError::Unknown(status) => Some(*status),
            _ => None,
        }
    }
}

/// Cache mutated only by the poller loop; everyone else reads copies.
pub struct PollerState {
    pub snapshots: HashMap<String, PresenceSnapshot>,
    pub consecutive_failures: u32,
    pub cycle: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl PollerState {
    pub fn new() -> Self {
        Self {
            snapshots: HashMap::new(),
            consecutive_failures: 0,
            cycle: 0,
            last_success: None,
            last_error: None,
        }
    }

    pub fn overview(&self, stale_after_secs: u64) -> PresenceOverview {
        let stale = match self.last_success {
            Some(ts) => Utc::now() - ts > Duration::seconds(stale_after_secs as i64),
            None => false,
        };
        let mut snapshots: Vec<PresenceSnapshot> = self.snapshots.values().cloned().collect();
        snapshots.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        PresenceOverview {
            snapshots,
            ready: self.last_success.is_some(),
            stale,
            last_success: self.last_success,
            last_error: self.last_error.clone(),
        }
    }
}

/// Copy-out view served to the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceOverview {
    pub snapshots: Vec<PresenceSnapshot>,
    pub ready: bool,
    pub stale: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
