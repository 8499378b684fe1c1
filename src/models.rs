use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

impl fmt::Display for OnlineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnlineStatus::Unknown => f.write_str("unknown"),
            OnlineStatus::Online => f.write_str("online"),
            OnlineStatus::Offline => f.write_str("offline"),
        }
    }
}

/// Why a status notification was emitted. Carried for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateSource {
    ProbeSuccess,
    LivenessTimer,
    Heartbeat,
    WorkerStop,
    ExplicitQuery,
}

impl UpdateSource {
    /// Sources that correspond to an actual state change rather than a re-announcement.
    pub fn is_transition(self) -> bool {
        matches!(
            self,
            UpdateSource::ProbeSuccess | UpdateSource::LivenessTimer | UpdateSource::WorkerStop
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub target: String,
    pub status: OnlineStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub source: UpdateSource,
}

/// Body of a `<base>/<target>/status` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub status: OnlineStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub update_source: UpdateSource,
}

impl From<&StatusUpdate> for StatusPayload {
    fn from(update: &StatusUpdate) -> Self {
        Self {
            status: update.status,
            last_seen: update.last_seen,
            update_source: update.source,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequencedRequest {
    #[serde(default)]
    pub seq: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub seq: i64,
    pub message: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsPayload {
    pub worker_count: usize,
    pub memory_usage_bytes: u64,
    pub process_uptime: u64,
}

/// Point-in-time view of a worker, used by queries and the HTTP listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub target: String,
    pub status: OnlineStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub valid: bool,
    pub stopped: bool,
}
