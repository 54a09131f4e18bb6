//! Write-side and view models used by repositories.
//!
//! Keep these structs focused on the data moved by queries. Orchestration
//! logic lives in `steps` and `control`.

use chrono::{DateTime, Utc};

use crate::model::{ApiLimits, ImageRecord, LastRunStats, SyncStatus};

/// Three-way field update: leave the column alone, write a value, or clear it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch<T> {
    Unchanged,
    Set(T),
    Remove,
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Unchanged
    }
}

impl<T> Patch<T> {
    /// `Some` becomes `Set`, `None` becomes `Remove`.
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Patch::Set(v),
            None => Patch::Remove,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Patch::Unchanged)
    }

    pub fn try_map<U, E>(&self, f: impl FnOnce(&T) -> Result<U, E>) -> Result<Patch<U>, E> {
        Ok(match self {
            Patch::Unchanged => Patch::Unchanged,
            Patch::Set(v) => Patch::Set(f(v)?),
            Patch::Remove => Patch::Remove,
        })
    }
}

/// Partial update of a control record. Fields left `Unchanged` are not written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlPatch {
    pub last_processed_page: Patch<i64>,
    pub current_sync_page: Patch<i64>,
    pub current_execution_arn: Patch<String>,
    pub last_known_status: Patch<SyncStatus>,
    pub api_limits: Patch<ApiLimits>,
    pub last_run_stats: Patch<LastRunStats>,
    pub last_sync_timestamp: Patch<DateTime<Utc>>,
}

impl ControlPatch {
    /// Status change with the execution handle replaced or cleared.
    pub fn status(status: SyncStatus, execution_arn: Option<String>) -> Self {
        Self {
            last_known_status: Patch::Set(status),
            current_execution_arn: Patch::from_option(execution_arn),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &ControlPatch::default()
    }
}

/// One page of the image listing plus the key to continue after, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePage {
    pub items: Vec<ImageRecord>,
    pub last_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageStats {
    pub count: i64,
    pub total_bytes: i64,
}
