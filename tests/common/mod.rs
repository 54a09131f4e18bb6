#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use imgu_sync::db;
use imgu_sync::engine::{EngineError, ExecutionDescription, ExecutionInput, WorkflowEngine};
use imgu_sync::model::{PhotoItem, RateLimit};
use imgu_sync::object_store::{ObjectStore, StoreError};
use imgu_sync::retry::RetryConfig;
use imgu_sync::steps::{StepSettings, SyncSteps};
use imgu_sync::unsplash::{PhotoPage, PhotoSource, RawImage, UpstreamError};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Mutex;

pub const SYNC: &str = "UNSPLASH_OLDEST_SYNC";

pub async fn setup_pool() -> db::Pool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn photo(id: &str, topic: &str) -> PhotoItem {
    PhotoItem::from_value(json!({
        "id": id,
        "urls": {
            "raw": format!("https://images.example/{id}"),
            "full": format!("https://images.example/{id}?fm=jpg&q=85"),
        },
        "topics": [{ "slug": topic }],
        "tags": [],
    }))
    .unwrap()
}

pub fn settings() -> StepSettings {
    StepSettings {
        default_category: "uncategorized".into(),
        default_extension: ".jpg".into(),
        public_url_prefix: "https://cdn.example".into(),
        retry: RetryConfig::immediate(0),
    }
}

pub fn rate_limit(limit: i64, remaining: i64) -> RateLimit {
    RateLimit {
        limit: Some(limit),
        remaining: Some(remaining),
    }
}

/// Pages through a fixed catalog; queued responses are served first.
#[derive(Clone, Default)]
pub struct RecordingPhotos {
    catalog: Arc<Vec<PhotoItem>>,
    queued: Arc<Mutex<VecDeque<Result<PhotoPage, UpstreamError>>>>,
    failing_urls: Arc<HashSet<String>>,
    page_calls: Arc<Mutex<Vec<(u32, u32)>>>,
    raw_calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingPhotos {
    pub fn with_catalog(catalog: Vec<PhotoItem>) -> Self {
        Self {
            catalog: Arc::new(catalog),
            ..Default::default()
        }
    }

    pub fn failing_downloads(mut self, urls: &[&str]) -> Self {
        self.failing_urls = Arc::new(urls.iter().map(|u| u.to_string()).collect());
        self
    }

    pub async fn queue(&self, response: Result<PhotoPage, UpstreamError>) {
        self.queued.lock().await.push_back(response);
    }

    pub async fn page_calls(&self) -> Vec<(u32, u32)> {
        self.page_calls.lock().await.clone()
    }

    pub async fn raw_calls(&self) -> Vec<String> {
        self.raw_calls.lock().await.clone()
    }
}

#[async_trait]
impl PhotoSource for RecordingPhotos {
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<PhotoPage, UpstreamError> {
        self.page_calls.lock().await.push((page, per_page));
        if let Some(response) = self.queued.lock().await.pop_front() {
            return response;
        }
        let start = ((page - 1) * per_page) as usize;
        let items = self
            .catalog
            .iter()
            .skip(start)
            .take(per_page as usize)
            .cloned()
            .collect();
        Ok(PhotoPage {
            items,
            rate_limit: rate_limit(50, 50 - page as i64),
        })
    }

    async fn fetch_raw(&self, url: &str) -> Result<RawImage, UpstreamError> {
        self.raw_calls.lock().await.push(url.to_string());
        if self.failing_urls.contains(url) {
            return Err(UpstreamError::Status {
                status_code: 404,
                body: "gone".into(),
                rate_limit: RateLimit::default(),
            });
        }
        Ok(RawImage {
            bytes: format!("bytes of {url}").into_bytes(),
            content_type: Some("image/jpeg".into()),
        })
    }
}

#[derive(Clone, Default)]
pub struct RecordingStore {
    failing_keys: Arc<HashSet<String>>,
    puts: Arc<Mutex<Vec<(String, usize, String)>>>,
}

impl RecordingStore {
    pub fn failing_keys(keys: &[&str]) -> Self {
        Self {
            failing_keys: Arc::new(keys.iter().map(|k| k.to_string()).collect()),
            ..Default::default()
        }
    }

    pub async fn puts(&self) -> Vec<(String, usize, String)> {
        self.puts.lock().await.clone()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.puts().await.into_iter().map(|(k, _, _)| k).collect()
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        if self.failing_keys.contains(key) {
            return Err(StoreError::Upload {
                key: key.to_string(),
                message: "bucket unavailable".into(),
            });
        }
        self.puts
            .lock()
            .await
            .push((key.to_string(), bytes.len(), content_type.to_string()));
        Ok(())
    }
}

pub fn steps(pool: &db::Pool, photos: &RecordingPhotos, store: &RecordingStore) -> SyncSteps {
    SyncSteps::new(
        pool.clone(),
        Arc::new(photos.clone()),
        Arc::new(store.clone()),
        settings(),
    )
}

/// How the fake engine answers `describe_execution` for a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Describe {
    Status(&'static str),
    Missing,
    Broken,
}

#[derive(Clone, Default)]
pub struct FakeEngine {
    next_id: Arc<AtomicU32>,
    describes: Arc<Mutex<HashMap<String, Describe>>>,
    start_error: Arc<Mutex<Option<String>>>,
    started: Arc<Mutex<Vec<ExecutionInput>>>,
    stopped: Arc<Mutex<Vec<String>>>,
}

impl FakeEngine {
    pub async fn set(&self, arn: &str, describe: Describe) {
        self.describes.lock().await.insert(arn.to_string(), describe);
    }

    pub async fn fail_next_start(&self, message: &str) {
        *self.start_error.lock().await = Some(message.to_string());
    }

    pub async fn started(&self) -> Vec<ExecutionInput> {
        self.started.lock().await.clone()
    }

    pub async fn stopped(&self) -> Vec<String> {
        self.stopped.lock().await.clone()
    }
}

#[async_trait]
impl WorkflowEngine for FakeEngine {
    async fn start_execution(&self, input: ExecutionInput) -> Result<String, EngineError> {
        if let Some(message) = self.start_error.lock().await.take() {
            return Err(EngineError::Other(message));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let arn = format!("fake:{}:{n}", input.sync_type);
        self.started.lock().await.push(input);
        self.set(&arn, Describe::Status("RUNNING")).await;
        Ok(arn)
    }

    async fn stop_execution(&self, execution_arn: &str) -> Result<(), EngineError> {
        match self.describes.lock().await.get(execution_arn) {
            None | Some(Describe::Missing) => {
                Err(EngineError::ExecutionDoesNotExist(execution_arn.to_string()))
            }
            Some(Describe::Broken) => Err(EngineError::Other("engine unavailable".into())),
            Some(Describe::Status(_)) => {
                self.stopped.lock().await.push(execution_arn.to_string());
                Ok(())
            }
        }
    }

    async fn describe_execution(&self, execution_arn: &str) -> Result<ExecutionDescription, EngineError> {
        match self.describes.lock().await.get(execution_arn).cloned() {
            None | Some(Describe::Missing) => {
                Err(EngineError::ExecutionDoesNotExist(execution_arn.to_string()))
            }
            Some(Describe::Broken) => Err(EngineError::Other("engine unavailable".into())),
            Some(Describe::Status(status)) => Ok(ExecutionDescription {
                execution_arn: execution_arn.to_string(),
                status: status.to_string(),
                start_date: chrono::Utc::now(),
                stop_date: None,
                error: None,
            }),
        }
    }
}

/// Delays every launch so the claim-to-handle window stays open.
#[derive(Clone)]
pub struct SlowEngine {
    pub inner: FakeEngine,
    pub launch_delay: std::time::Duration,
}

#[async_trait]
impl WorkflowEngine for SlowEngine {
    async fn start_execution(&self, input: ExecutionInput) -> Result<String, EngineError> {
        tokio::time::sleep(self.launch_delay).await;
        self.inner.start_execution(input).await
    }

    async fn stop_execution(&self, execution_arn: &str) -> Result<(), EngineError> {
        self.inner.stop_execution(execution_arn).await
    }

    async fn describe_execution(&self, execution_arn: &str) -> Result<ExecutionDescription, EngineError> {
        self.inner.describe_execution(execution_arn).await
    }
}
