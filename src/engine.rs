//! Workflow engine seam and the in-process engine that drives the step protocol.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::model::{RunOutcome, SyncStatus};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::steps::SyncSteps;
use crate::unsplash::UpstreamError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("execution {0} does not exist")]
    ExecutionDoesNotExist(String),
    #[error("workflow engine error: {0}")]
    Other(String),
}

/// Seed of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInput {
    pub sync_type: String,
    pub start_page: i64,
    pub batch_size: u32,
    pub wait_seconds: u64,
}

/// What the engine reports about an execution, in the engine's own vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDescription {
    pub execution_arn: String,
    pub status: String,
    pub start_date: DateTime<Utc>,
    pub stop_date: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Launch an execution and return its handle.
    async fn start_execution(&self, input: ExecutionInput) -> Result<String, EngineError>;

    /// Ask an execution to stop. Cooperative; completion is observed through `describe_execution`.
    async fn stop_execution(&self, execution_arn: &str) -> Result<(), EngineError>;

    async fn describe_execution(&self, execution_arn: &str) -> Result<ExecutionDescription, EngineError>;
}

/// Map engine status vocabulary onto the control-record status.
pub fn map_engine_status(status: &str) -> SyncStatus {
    match status {
        "RUNNING" | "PENDING_REDRIVE" => SyncStatus::Running,
        "SUCCEEDED" => SyncStatus::Succeeded,
        "FAILED" => SyncStatus::Failed,
        "TIMED_OUT" => SyncStatus::TimedOut,
        "ABORTED" => SyncStatus::Aborted,
        _ => SyncStatus::Unknown,
    }
}

struct Execution {
    outcome: Option<RunOutcome>,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
    error: Option<String>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Execution {
    fn status(&self) -> &'static str {
        match self.outcome {
            None => "RUNNING",
            Some(outcome) => SyncStatus::from(outcome).as_str(),
        }
    }
}

type Executions = Arc<Mutex<HashMap<String, Execution>>>;

/// Finished executions kept for `describe_execution` before the oldest are dropped.
pub const DEFAULT_FINISHED_HISTORY: usize = 32;

/// Drop the oldest finished executions beyond `keep`. Running ones always stay.
fn prune_finished(executions: &mut HashMap<String, Execution>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, String)> = executions
        .iter()
        .filter_map(|(arn, exec)| exec.stopped_at.map(|at| (at, arn.clone())))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, arn) in finished.into_iter().take(excess) {
        executions.remove(&arn);
    }
}

/// Runs executions as tokio tasks in this process. Each execution pages
/// through the catalog from its start page, waiting between pages.
#[derive(Clone)]
pub struct LocalEngine {
    steps: Arc<SyncSteps>,
    fetch_retry: RetryConfig,
    max_duration: Option<Duration>,
    finished_history: usize,
    executions: Executions,
}

impl LocalEngine {
    pub fn new(steps: Arc<SyncSteps>, fetch_retry: RetryConfig, max_duration: Option<Duration>) -> Self {
        Self {
            steps,
            fetch_retry,
            max_duration,
            finished_history: DEFAULT_FINISHED_HISTORY,
            executions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_finished_history(mut self, keep: usize) -> Self {
        self.finished_history = keep;
        self
    }

    /// Signal every running execution to stop and wait for them to finalize.
    pub async fn shutdown(&self) {
        let tasks: Vec<(String, JoinHandle<()>)> = {
            let mut guard = self.executions.lock().await;
            guard
                .iter_mut()
                .filter(|(_, exec)| exec.outcome.is_none())
                .filter_map(|(arn, exec)| {
                    let _ = exec.cancel.send(true);
                    exec.task.take().map(|t| (arn.clone(), t))
                })
                .collect()
        };
        for (arn, task) in tasks {
            if let Err(err) = task.await {
                error!(%arn, error = %err, "execution task panicked");
            }
        }
    }
}

#[async_trait]
impl WorkflowEngine for LocalEngine {
    #[instrument(skip(self))]
    async fn start_execution(&self, input: ExecutionInput) -> Result<String, EngineError> {
        if input.batch_size == 0 {
            return Err(EngineError::Other("batch size must be >= 1".into()));
        }
        let arn = format!("local:{}:{}", input.sync_type, Uuid::new_v4());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let deadline = self.max_duration.map(|d| Instant::now() + d);

        // Hold the lock across spawn so the task cannot record its outcome
        // before its slot exists.
        let mut guard = self.executions.lock().await;
        prune_finished(&mut guard, self.finished_history);
        let task = tokio::spawn(run_execution(
            self.steps.clone(),
            self.executions.clone(),
            arn.clone(),
            input,
            self.fetch_retry.clone(),
            cancel_rx,
            deadline,
        ));
        guard.insert(
            arn.clone(),
            Execution {
                outcome: None,
                started_at: Utc::now(),
                stopped_at: None,
                error: None,
                cancel: cancel_tx,
                task: Some(task),
            },
        );
        info!(%arn, "execution started");
        Ok(arn)
    }

    async fn stop_execution(&self, execution_arn: &str) -> Result<(), EngineError> {
        let guard = self.executions.lock().await;
        let exec = guard
            .get(execution_arn)
            .ok_or_else(|| EngineError::ExecutionDoesNotExist(execution_arn.to_string()))?;
        if exec.outcome.is_none() {
            let _ = exec.cancel.send(true);
            info!(arn = %execution_arn, "stop requested");
        }
        Ok(())
    }

    async fn describe_execution(&self, execution_arn: &str) -> Result<ExecutionDescription, EngineError> {
        let guard = self.executions.lock().await;
        let exec = guard
            .get(execution_arn)
            .ok_or_else(|| EngineError::ExecutionDoesNotExist(execution_arn.to_string()))?;
        Ok(ExecutionDescription {
            execution_arn: execution_arn.to_string(),
            status: exec.status().to_string(),
            start_date: exec.started_at,
            stop_date: exec.stopped_at,
            error: exec.error.clone(),
        })
    }
}

async fn run_execution(
    steps: Arc<SyncSteps>,
    executions: Executions,
    arn: String,
    input: ExecutionInput,
    fetch_retry: RetryConfig,
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
) {
    let (outcome, error_info) = drive(&steps, &input, &fetch_retry, cancel, deadline).await;
    match outcome {
        RunOutcome::Succeeded => info!(%arn, "execution succeeded"),
        _ => warn!(%arn, ?outcome, error = ?error_info, "execution ended"),
    }
    steps
        .finalize(&input.sync_type, outcome, error_info.clone())
        .await;

    let mut guard = executions.lock().await;
    if let Some(exec) = guard.get_mut(&arn) {
        exec.outcome = Some(outcome);
        exec.stopped_at = Some(Utc::now());
        exec.error = error_info;
        // Dropping our own handle detaches; the task is about to return.
        exec.task = None;
    }
}

async fn until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn drive(
    steps: &SyncSteps,
    input: &ExecutionInput,
    fetch_retry: &RetryConfig,
    mut cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
) -> (RunOutcome, Option<String>) {
    let mut page = input.start_page.max(1);
    loop {
        if *cancel.borrow() {
            return (RunOutcome::Aborted, Some("stop requested".into()));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return (RunOutcome::TimedOut, Some("execution exceeded its time limit".into()));
        }
        let Ok(page_no) = u32::try_from(page) else {
            return (RunOutcome::Failed, Some(format!("page {page} out of range")));
        };

        let fetched = retry_with_backoff(
            fetch_retry,
            "fetch_page",
            UpstreamError::is_retryable,
            || steps.fetch_page(page_no, input.batch_size),
        )
        .await;
        let fetched = match fetched {
            Ok(p) => p,
            Err(err) => {
                if let Some(rate_limit) = err.rate_limit() {
                    steps.record_rate_limit(&input.sync_type, rate_limit).await;
                }
                return (RunOutcome::Failed, Some(err.to_string()));
            }
        };
        if fetched.items.is_empty() {
            info!(page, "catalog exhausted");
            return (RunOutcome::Succeeded, None);
        }

        let count = fetched.items.len();
        let report = steps.process_page(&fetched.items).await;
        let complete = count >= input.batch_size as usize;
        steps
            .checkpoint(&input.sync_type, page, Some(fetched.rate_limit), complete)
            .await;
        info!(
            page,
            count,
            stored = report.stored,
            skipped = report.skipped,
            failed = report.failed,
            "page processed"
        );
        if !complete {
            return (RunOutcome::Succeeded, None);
        }

        page += 1;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(input.wait_seconds)) => {}
            _ = cancel.changed() => {}
            _ = until_deadline(deadline) => {}
        }
    }
}
