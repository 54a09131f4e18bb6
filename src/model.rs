use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Sync type tracked when no other stream is configured.
pub const DEFAULT_SYNC_TYPE: &str = "UNSPLASH_OLDEST_SYNC";

/// Last observed status of a sync stream, as stored in the control record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Idle,
    Running,
    Stopping,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
    Unknown,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "IDLE",
            SyncStatus::Running => "RUNNING",
            SyncStatus::Stopping => "STOPPING",
            SyncStatus::Succeeded => "SUCCEEDED",
            SyncStatus::Failed => "FAILED",
            SyncStatus::TimedOut => "TIMED_OUT",
            SyncStatus::Aborted => "ABORTED",
            SyncStatus::Unknown => "UNKNOWN",
        }
    }

    /// Parse a stored status. Unrecognised text maps to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "IDLE" => SyncStatus::Idle,
            "RUNNING" => SyncStatus::Running,
            "STOPPING" => SyncStatus::Stopping,
            "SUCCEEDED" => SyncStatus::Succeeded,
            "FAILED" => SyncStatus::Failed,
            "TIMED_OUT" => SyncStatus::TimedOut,
            "ABORTED" => SyncStatus::Aborted,
            _ => SyncStatus::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Succeeded | SyncStatus::Failed | SyncStatus::TimedOut | SyncStatus::Aborted
        )
    }

    /// RUNNING or STOPPING: an execution is believed to be in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncStatus::Running | SyncStatus::Stopping)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome reported by the engine when a run closes out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

impl From<RunOutcome> for SyncStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Succeeded => SyncStatus::Succeeded,
            RunOutcome::Failed => SyncStatus::Failed,
            RunOutcome::TimedOut => SyncStatus::TimedOut,
            RunOutcome::Aborted => SyncStatus::Aborted,
        }
    }
}

/// Rate-limit headers as returned by one upstream call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
}

impl RateLimit {
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none()
    }
}

/// Rate-limit snapshot persisted on the control record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiLimits {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub last_checked_timestamp: DateTime<Utc>,
}

impl ApiLimits {
    pub fn observed(rate_limit: RateLimit, at: DateTime<Utc>) -> Self {
        Self {
            limit: rate_limit.limit,
            remaining: rate_limit.remaining,
            last_checked_timestamp: at,
        }
    }
}

/// Outcome of the most recently finalized run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastRunStats {
    pub end_time: DateTime<Utc>,
    pub status: SyncStatus,
    pub error_info: Option<String>,
}

/// One control record per sync type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlRecord {
    pub sync_type: String,
    pub last_processed_page: Option<i64>,
    pub current_sync_page: Option<i64>,
    pub current_execution_arn: Option<String>,
    pub last_known_status: SyncStatus,
    pub api_limits: Option<ApiLimits>,
    pub last_run_stats: Option<LastRunStats>,
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub last_updated_timestamp: DateTime<Utc>,
}

const PENDING_HANDLE_PREFIX: &str = "pending:";

/// Placeholder handle held by a start claim until the engine returns the real one.
pub fn pending_handle() -> String {
    format!("{PENDING_HANDLE_PREFIX}{}", Uuid::new_v4())
}

pub fn is_pending_handle(handle: &str) -> bool {
    handle.starts_with(PENDING_HANDLE_PREFIX)
}

/// A photo as listed by the upstream catalog: the full JSON payload plus the
/// handful of fields the sync path reads.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoItem {
    pub id: String,
    pub urls: PhotoUrls,
    pub topics: Vec<Topic>,
    pub tags: Vec<Tag>,
    pub raw: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhotoUrls {
    pub raw: Option<String>,
    pub full: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topic {
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub title: Option<String>,
}

#[derive(Deserialize)]
struct PhotoFields {
    id: String,
    #[serde(default)]
    urls: PhotoUrls,
    #[serde(default)]
    topics: Vec<Topic>,
    #[serde(default)]
    tags: Vec<Tag>,
}

impl PhotoItem {
    pub fn from_value(raw: Value) -> Result<Self, serde_json::Error> {
        let fields: PhotoFields = serde_json::from_value(raw.clone())?;
        Ok(Self {
            id: fields.id,
            urls: fields.urls,
            topics: fields.topics,
            tags: fields.tags,
            raw,
        })
    }

    /// Full-resolution download URL, falling back to the raw URL.
    pub fn download_url(&self) -> Option<&str> {
        non_blank(&self.urls.full).or_else(|| non_blank(&self.urls.raw))
    }
}

fn non_blank(url: &Option<String>) -> Option<&str> {
    url.as_deref().filter(|u| !u.trim().is_empty())
}

impl Serialize for PhotoItem {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PhotoItem {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        PhotoItem::from_value(raw).map_err(serde::de::Error::custom)
    }
}

/// Metadata row written once an image is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub photo_id: String,
    pub category: String,
    pub object_key: String,
    pub public_url: String,
    pub byte_size: i64,
    pub content_type: String,
    pub synced_at: DateTime<Utc>,
    pub payload: Value,
}
