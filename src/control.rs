//! Operator protocol: start, stop, status and summary for one sync type.
//!
//! The control record is reconciled against the workflow engine on start and
//! on status; the engine is the source of truth for whether a run is live.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::db::{self, Pool};
use crate::engine::{map_engine_status, EngineError, ExecutionInput, WorkflowEngine};
use crate::model::{is_pending_handle, ApiLimits, ControlRecord, LastRunStats, SyncStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started {
        execution_arn: String,
        resumed_from_page: i64,
    },
    Conflict {
        existing_arn: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Accepted { execution_arn: String },
    MissingHandle,
    StaleHandle { execution_arn: String },
    /// A start is claimed but its execution handle is not recorded yet.
    Launching,
}

/// How long a start claim may stay unresolved before it is treated as crashed.
pub const DEFAULT_CLAIM_TIMEOUT_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub sync_type: String,
    pub status: SyncStatus,
    pub execution_arn: Option<String>,
    pub stale: bool,
    pub current_sync_page: Option<i64>,
    pub last_processed_page: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub sync_type: String,
    pub current_page: Option<i64>,
    pub last_processed_page: Option<i64>,
    pub last_known_status: SyncStatus,
    pub last_run_stats: Option<LastRunStats>,
    pub api_limits: Option<ApiLimits>,
    pub estimated_api_reset: Option<DateTime<Utc>>,
    pub overall_item_count: i64,
    pub overall_storage_bytes: i64,
    pub overall_storage_human: String,
}

pub struct SyncController {
    pool: Pool,
    engine: Arc<dyn WorkflowEngine>,
    sync_type: String,
    batch_size: u32,
    wait_seconds: u64,
    claim_timeout: Duration,
}

impl SyncController {
    pub fn new(
        pool: Pool,
        engine: Arc<dyn WorkflowEngine>,
        sync_type: String,
        batch_size: u32,
        wait_seconds: u64,
    ) -> Self {
        Self {
            pool,
            engine,
            sync_type,
            batch_size,
            wait_seconds,
            claim_timeout: Duration::seconds(DEFAULT_CLAIM_TIMEOUT_SECS),
        }
    }

    pub fn from_config(pool: Pool, engine: Arc<dyn WorkflowEngine>, cfg: &Config) -> Self {
        Self::new(
            pool,
            engine,
            cfg.app.sync_type.clone(),
            cfg.sync.batch_size,
            cfg.sync.wait_seconds,
        )
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    pub fn sync_type(&self) -> &str {
        &self.sync_type
    }

    fn claim_expired(&self, record: &ControlRecord) -> bool {
        Utc::now() - record.last_updated_timestamp >= self.claim_timeout
    }

    /// Conditional status/handle move on the operator path; a failed or lost
    /// write is logged, never raised.
    async fn transition_best_effort(
        &self,
        from: (SyncStatus, Option<&str>),
        to: (SyncStatus, Option<&str>),
        what: &str,
    ) -> bool {
        match db::transition_control(&self.pool, &self.sync_type, from, to).await {
            Ok(true) => true,
            Ok(false) => {
                info!(what, "control record changed concurrently; write skipped");
                false
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), what, "control record write failed");
                false
            }
        }
    }

    async fn conflict(&self) -> Result<StartOutcome> {
        let current = db::get_sync_control(&self.pool, &self.sync_type).await?;
        Ok(StartOutcome::Conflict {
            existing_arn: current
                .and_then(|r| r.current_execution_arn)
                .filter(|arn| !is_pending_handle(arn)),
        })
    }

    #[instrument(skip(self), fields(sync_type = %self.sync_type))]
    pub async fn start(&self) -> Result<StartOutcome> {
        let record = db::get_sync_control(&self.pool, &self.sync_type).await?;
        let mut previous = record
            .as_ref()
            .map(|r| r.last_known_status)
            .unwrap_or(SyncStatus::Idle);

        if let Some(rec) = record.as_ref().filter(|r| r.last_known_status.is_active()) {
            let healed = match rec.current_execution_arn.as_deref() {
                Some(marker) if is_pending_handle(marker) => {
                    if !self.claim_expired(rec) {
                        info!("another start is launching; refusing start");
                        return Ok(StartOutcome::Conflict { existing_arn: None });
                    }
                    warn!(%marker, "start claim never resolved; treating as crashed");
                    SyncStatus::Failed
                }
                Some(arn) => match self.engine.describe_execution(arn).await {
                    Ok(desc) => {
                        let live = map_engine_status(&desc.status);
                        if !live.is_terminal() {
                            info!(%arn, %live, "execution still live; refusing start");
                            return Ok(StartOutcome::Conflict {
                                existing_arn: Some(arn.to_string()),
                            });
                        }
                        live
                    }
                    Err(EngineError::ExecutionDoesNotExist(_)) => SyncStatus::Idle,
                    Err(err) => {
                        warn!(%arn, error = %err, "cannot verify tracked execution; refusing start");
                        return Ok(StartOutcome::Conflict {
                            existing_arn: Some(arn.to_string()),
                        });
                    }
                },
                None => SyncStatus::Failed,
            };
            let from = (rec.last_known_status, rec.current_execution_arn.as_deref());
            if !db::transition_control(&self.pool, &self.sync_type, from, (healed, None)).await? {
                info!("control record changed while healing; refusing start");
                return self.conflict().await;
            }
            info!(from = %rec.last_known_status, to = %healed, "healed stale control record");
            previous = healed;
        }

        let start_page = db::resolve_start_page(record.as_ref());
        let Some(marker) = db::claim_for_start(&self.pool, &self.sync_type).await? else {
            info!("lost start claim to a concurrent caller");
            return self.conflict().await;
        };

        let input = ExecutionInput {
            sync_type: self.sync_type.clone(),
            start_page,
            batch_size: self.batch_size,
            wait_seconds: self.wait_seconds,
        };
        let claimed = (SyncStatus::Running, Some(marker.as_str()));
        match self.engine.start_execution(input).await {
            Ok(arn) => {
                self.transition_best_effort(
                    claimed,
                    (SyncStatus::Running, Some(arn.as_str())),
                    "record started execution",
                )
                .await;
                info!(%arn, start_page, "sync started");
                Ok(StartOutcome::Started {
                    execution_arn: arn,
                    resumed_from_page: start_page,
                })
            }
            Err(err) => {
                self.transition_best_effort(claimed, (previous, None), "release start claim")
                    .await;
                Err(err).context("start workflow execution")
            }
        }
    }

    #[instrument(skip(self), fields(sync_type = %self.sync_type))]
    pub async fn stop(&self, execution_arn: Option<String>) -> Result<StopOutcome> {
        let record = db::get_sync_control(&self.pool, &self.sync_type).await?;
        let tracked = record.as_ref().and_then(|r| r.current_execution_arn.clone());
        let fallback = record
            .as_ref()
            .filter(|r| r.last_known_status.is_active())
            .and_then(|r| r.current_execution_arn.clone());
        let Some(arn) = execution_arn
            .filter(|a| !a.trim().is_empty())
            .or(fallback)
        else {
            return Ok(StopOutcome::MissingHandle);
        };
        if is_pending_handle(&arn) {
            return Ok(StopOutcome::Launching);
        }
        let tracks_arn = tracked.as_deref() == Some(arn.as_str());

        match self.engine.stop_execution(&arn).await {
            Ok(()) => {
                if tracks_arn {
                    let status = record
                        .as_ref()
                        .map(|r| r.last_known_status)
                        .unwrap_or(SyncStatus::Idle);
                    self.transition_best_effort(
                        (status, Some(arn.as_str())),
                        (SyncStatus::Stopping, Some(arn.as_str())),
                        "mark stopping",
                    )
                    .await;
                }
                info!(%arn, "stop accepted");
                Ok(StopOutcome::Accepted { execution_arn: arn })
            }
            Err(EngineError::ExecutionDoesNotExist(_)) => {
                if let Some(rec) = record.as_ref().filter(|_| tracks_arn) {
                    self.transition_best_effort(
                        (rec.last_known_status, Some(arn.as_str())),
                        (SyncStatus::Idle, None),
                        "clear vanished execution",
                    )
                    .await;
                }
                info!(%arn, "execution already gone");
                Ok(StopOutcome::StaleHandle { execution_arn: arn })
            }
            Err(err) => Err(err).context("stop workflow execution"),
        }
    }

    #[instrument(skip(self), fields(sync_type = %self.sync_type))]
    pub async fn status(&self) -> Result<StatusReport> {
        let Some(record) = db::get_sync_control(&self.pool, &self.sync_type).await? else {
            return Ok(StatusReport {
                sync_type: self.sync_type.clone(),
                status: SyncStatus::Idle,
                execution_arn: None,
                stale: false,
                current_sync_page: None,
                last_processed_page: None,
            });
        };

        let stored = record.last_known_status;
        let (status, arn, stale) = match record.current_execution_arn.clone() {
            // Launch in progress: nothing to ask the engine yet.
            Some(marker) if is_pending_handle(&marker) => {
                if !stored.is_active() {
                    (stored, None, false)
                } else if !self.claim_expired(&record) {
                    (stored, None, true)
                } else {
                    (SyncStatus::Failed, None, false)
                }
            }
            Some(arn) => match self.engine.describe_execution(&arn).await {
                Ok(desc) => match map_engine_status(&desc.status) {
                    live if live.is_terminal() => (live, None, false),
                    SyncStatus::Running if stored == SyncStatus::Stopping => {
                        (SyncStatus::Stopping, Some(arn), false)
                    }
                    live => (live, Some(arn), false),
                },
                Err(EngineError::ExecutionDoesNotExist(_)) => (SyncStatus::Idle, None, false),
                Err(err) => {
                    warn!(%arn, error = %err, "describe failed; reporting stored status");
                    (stored, Some(arn), true)
                }
            },
            None if stored.is_active() => (SyncStatus::Failed, None, false),
            None => (stored, None, false),
        };

        let changed = status != stored || arn != record.current_execution_arn;
        if changed && !stale && status != SyncStatus::Unknown {
            let moved = self
                .transition_best_effort(
                    (stored, record.current_execution_arn.as_deref()),
                    (status, arn.as_deref()),
                    "reconcile status",
                )
                .await;
            if moved {
                info!(from = %stored, to = %status, "reconciled control record");
            }
        }

        Ok(StatusReport {
            sync_type: self.sync_type.clone(),
            status,
            execution_arn: arn,
            stale,
            current_sync_page: record.current_sync_page,
            last_processed_page: record.last_processed_page,
        })
    }

    /// Read-only view mixing the control record with store-level totals.
    #[instrument(skip(self), fields(sync_type = %self.sync_type))]
    pub async fn summary(&self) -> Result<Summary> {
        let record = db::get_sync_control(&self.pool, &self.sync_type).await?;
        let stats = db::image_stats(&self.pool).await?;
        let ControlRecordView {
            current_page,
            last_processed_page,
            last_known_status,
            last_run_stats,
            api_limits,
        } = record.map(ControlRecordView::from).unwrap_or_default();

        Ok(Summary {
            sync_type: self.sync_type.clone(),
            current_page,
            last_processed_page,
            last_known_status,
            estimated_api_reset: api_limits
                .as_ref()
                .and_then(|l| estimate_api_reset(l.last_checked_timestamp)),
            last_run_stats,
            api_limits,
            overall_item_count: stats.count,
            overall_storage_bytes: stats.total_bytes,
            overall_storage_human: format_bytes(stats.total_bytes),
        })
    }
}

struct ControlRecordView {
    current_page: Option<i64>,
    last_processed_page: Option<i64>,
    last_known_status: SyncStatus,
    last_run_stats: Option<LastRunStats>,
    api_limits: Option<ApiLimits>,
}

impl Default for ControlRecordView {
    fn default() -> Self {
        Self {
            current_page: None,
            last_processed_page: None,
            last_known_status: SyncStatus::Idle,
            last_run_stats: None,
            api_limits: None,
        }
    }
}

impl From<ControlRecord> for ControlRecordView {
    fn from(r: ControlRecord) -> Self {
        Self {
            current_page: r.current_sync_page,
            last_processed_page: r.last_processed_page,
            last_known_status: r.last_known_status,
            last_run_stats: r.last_run_stats,
            api_limits: r.api_limits,
        }
    }
}

/// Upstream quotas reset hourly: the top of the hour after the last check.
pub fn estimate_api_reset(last_checked: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let hour = last_checked
        .with_minute(0)?
        .with_second(0)?
        .with_nanosecond(0)?;
    Some(hour + Duration::hours(1))
}

/// 1024-based human size with up to two decimals: `0 Bytes`, `1.5 KB`, `2 MB`.
pub fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 9] = ["Bytes", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let abs = bytes.unsigned_abs() as f64;
    let exp = ((abs.ln() / 1024f64.ln()).floor() as usize).min(UNITS.len() - 1);
    let value = bytes as f64 / 1024f64.powi(exp as i32);
    let formatted = format!("{value:.2}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[exp])
}
