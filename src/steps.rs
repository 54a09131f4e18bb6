//! Per-iteration step protocol invoked by the workflow engine.
//!
//! Every step is a stateless call on shared clients: the engine owns the page
//! counter and passes it in, the steps never track it themselves.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::category::resolve_category;
use crate::config::Config;
use crate::db::{self, ControlPatch, LookupError, Patch, Pool};
use crate::model::{ApiLimits, ImageRecord, LastRunStats, PhotoItem, RateLimit, RunOutcome};
use crate::object_store::{
    content_type_for_extension, extension_for_url, object_key, public_url, ObjectStore, R2Store,
    StoreError,
};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::unsplash::{PhotoPage, PhotoSource, UnsplashClient, UpstreamError};

/// Failure of a single item; counted by `process_page`, never fatal to the page.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("item {0} has no download URL")]
    MissingUrl(String),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("download failed: {0}")]
    Download(#[source] UpstreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("metadata write failed: {0:#}")]
    Metadata(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Item(#[from] ItemError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepSettings {
    pub default_category: String,
    pub default_extension: String,
    pub public_url_prefix: String,
    pub retry: RetryConfig,
}

impl StepSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            default_category: cfg.sync.default_category.clone(),
            default_extension: cfg.sync.default_extension.clone(),
            public_url_prefix: cfg.r2.public_url_prefix.clone(),
            retry: cfg.sync.retry.clone(),
        }
    }
}

fn default_complete() -> bool {
    true
}

/// One engine-invoked action, tagged by `action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepRequest {
    #[serde(rename_all = "camelCase")]
    FetchPage { page: u32, page_size: u32 },
    #[serde(rename_all = "camelCase")]
    ItemExists { item_id: String },
    DownloadAndStore { item: PhotoItem },
    #[serde(rename_all = "camelCase")]
    Checkpoint {
        sync_type: String,
        page: i64,
        #[serde(default)]
        rate_limit: Option<RateLimit>,
        #[serde(default = "default_complete")]
        complete: bool,
    },
    #[serde(rename_all = "camelCase")]
    Finalize {
        sync_type: String,
        status: RunOutcome,
        #[serde(default)]
        error_info: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepResponse {
    #[serde(rename_all = "camelCase")]
    Page {
        items: Vec<PhotoItem>,
        rate_limit: RateLimit,
    },
    Exists { exists: bool },
    Stored(StoredItem),
    Ack { ok: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredItem {
    pub item_id: String,
    pub storage_key: String,
    pub byte_size: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageReport {
    pub stored: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct SyncSteps {
    pool: Pool,
    photos: Arc<dyn PhotoSource>,
    objects: Arc<dyn ObjectStore>,
    settings: StepSettings,
}

impl SyncSteps {
    pub fn new(
        pool: Pool,
        photos: Arc<dyn PhotoSource>,
        objects: Arc<dyn ObjectStore>,
        settings: StepSettings,
    ) -> Self {
        Self {
            pool,
            photos,
            objects,
            settings,
        }
    }

    /// Production wiring: Unsplash for photos, R2 for objects.
    pub fn from_config(pool: Pool, cfg: &Config) -> Result<Self, UpstreamError> {
        let photos = UnsplashClient::from_config(cfg)?;
        let objects = R2Store::new(&cfg.r2);
        Ok(Self::new(
            pool,
            Arc::new(photos),
            Arc::new(objects),
            StepSettings::from_config(cfg),
        ))
    }

    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }

    pub async fn dispatch(&self, request: StepRequest) -> Result<StepResponse, StepError> {
        match request {
            StepRequest::FetchPage { page, page_size } => {
                let PhotoPage { items, rate_limit } = self.fetch_page(page, page_size).await?;
                Ok(StepResponse::Page { items, rate_limit })
            }
            StepRequest::ItemExists { item_id } => {
                let exists = self.item_exists(&item_id).await.map_err(ItemError::from)?;
                Ok(StepResponse::Exists { exists })
            }
            StepRequest::DownloadAndStore { item } => {
                Ok(StepResponse::Stored(self.download_and_store(&item).await?))
            }
            StepRequest::Checkpoint {
                sync_type,
                page,
                rate_limit,
                complete,
            } => {
                let ok = self.checkpoint(&sync_type, page, rate_limit, complete).await;
                Ok(StepResponse::Ack { ok })
            }
            StepRequest::Finalize {
                sync_type,
                status,
                error_info,
            } => {
                let ok = self.finalize(&sync_type, status, error_info).await;
                Ok(StepResponse::Ack { ok })
            }
        }
    }

    /// One upstream call; retry policy belongs to the caller.
    pub async fn fetch_page(&self, page: u32, page_size: u32) -> Result<PhotoPage, UpstreamError> {
        self.photos.fetch_page(page, page_size).await
    }

    pub async fn item_exists(&self, item_id: &str) -> Result<bool, LookupError> {
        db::image_exists(&self.pool, item_id).await
    }

    #[instrument(skip_all, fields(item_id = %item.id))]
    pub async fn download_and_store(&self, item: &PhotoItem) -> Result<StoredItem, ItemError> {
        let url = item
            .download_url()
            .ok_or_else(|| ItemError::MissingUrl(item.id.clone()))?;
        let raw = retry_with_backoff(
            &self.settings.retry,
            "download",
            UpstreamError::is_retryable,
            || self.photos.fetch_raw(url),
        )
        .await
        .map_err(ItemError::Download)?;

        let category = resolve_category(item, &self.settings.default_category);
        let ext = extension_for_url(url, &self.settings.default_extension);
        let key = object_key(&category, &item.id, &ext);
        let content_type = raw
            .content_type
            .unwrap_or_else(|| content_type_for_extension(&ext).to_string());
        let byte_size = raw.bytes.len() as i64;

        self.objects.put_object(&key, raw.bytes, &content_type).await?;

        let record = ImageRecord {
            photo_id: item.id.clone(),
            category,
            object_key: key.clone(),
            public_url: public_url(&self.settings.public_url_prefix, &key),
            byte_size,
            content_type,
            synced_at: Utc::now(),
            payload: item.raw.clone(),
        };
        db::put_image(&self.pool, &record)
            .await
            .map_err(ItemError::Metadata)?;

        info!(key = %key, byte_size, "stored image");
        Ok(StoredItem {
            item_id: item.id.clone(),
            storage_key: key,
            byte_size,
        })
    }

    /// Exists? skip : download and store, for every item. Errors are counted.
    pub async fn process_page(&self, items: &[PhotoItem]) -> PageReport {
        let mut report = PageReport::default();
        for item in items {
            match self.item_exists(&item.id).await {
                Ok(true) => {
                    report.skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(item_id = %item.id, error = %err, "existence check failed; item not processed");
                    report.failed += 1;
                    continue;
                }
            }
            match self.download_and_store(item).await {
                Ok(_) => report.stored += 1,
                Err(err) => {
                    warn!(item_id = %item.id, error = %err, "item failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Best-effort progress write; `false` means every attempt failed.
    #[instrument(skip(self, rate_limit))]
    pub async fn checkpoint(
        &self,
        sync_type: &str,
        page: i64,
        rate_limit: Option<RateLimit>,
        complete: bool,
    ) -> bool {
        let limits = rate_limit
            .filter(|rl| !rl.is_empty())
            .map(|rl| ApiLimits::observed(rl, Utc::now()));
        let res = retry_with_backoff(&self.settings.retry, "checkpoint", |_| true, || {
            db::record_checkpoint(&self.pool, sync_type, page, limits.as_ref(), complete)
        })
        .await;
        match res {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "checkpoint not persisted");
                false
            }
        }
    }

    /// Persist the quota seen on a failed fetch, without touching progress.
    pub async fn record_rate_limit(&self, sync_type: &str, rate_limit: RateLimit) -> bool {
        let patch = ControlPatch {
            api_limits: Patch::Set(ApiLimits::observed(rate_limit, Utc::now())),
            ..Default::default()
        };
        match db::update_sync_control(&self.pool, sync_type, &patch).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "rate limit snapshot not persisted");
                false
            }
        }
    }

    /// Close out a run's bookkeeping. The execution handle is left for status
    /// reconciliation to clear.
    #[instrument(skip(self, error_info))]
    pub async fn finalize(
        &self,
        sync_type: &str,
        status: RunOutcome,
        error_info: Option<String>,
    ) -> bool {
        let patch = ControlPatch {
            last_run_stats: Patch::Set(LastRunStats {
                end_time: Utc::now(),
                status: status.into(),
                error_info,
            }),
            current_sync_page: Patch::Remove,
            ..Default::default()
        };
        let res = retry_with_backoff(&self.settings.retry, "finalize", |_| true, || {
            db::update_sync_control(&self.pool, sync_type, &patch)
        })
        .await;
        match res {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "finalize not persisted");
                false
            }
        }
    }
}
