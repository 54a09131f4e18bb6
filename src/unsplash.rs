use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, Url};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::model::{PhotoItem, RateLimit};

const UNSPLASH_API_BASE: &str = "https://api.unsplash.com/";
const RATE_LIMIT_HEADER: &str = "x-ratelimit-limit";
const RATE_REMAINING_HEADER: &str = "x-ratelimit-remaining";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream returned {status_code}: {body}")]
    Status {
        status_code: u16,
        body: String,
        rate_limit: RateLimit,
    },
    #[error("failed to reach upstream: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid upstream payload: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Throttling, server errors and transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Status { status_code, .. } => {
                *status_code == 429 || (500..600).contains(status_code)
            }
            UpstreamError::Transport(_) => true,
            UpstreamError::Decode(_) | UpstreamError::InvalidRequest(_) => false,
        }
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        match self {
            UpstreamError::Status { rate_limit, .. } if !rate_limit.is_empty() => Some(*rate_limit),
            _ => None,
        }
    }
}

/// One page of catalog items with the rate-limit telemetry of the call.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoPage {
    pub items: Vec<PhotoItem>,
    pub rate_limit: RateLimit,
}

/// Downloaded image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait PhotoSource: Send + Sync {
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<PhotoPage, UpstreamError>;

    async fn fetch_raw(&self, url: &str) -> Result<RawImage, UpstreamError>;
}

#[derive(Clone)]
pub struct UnsplashClient {
    http: Client,
    base_url: Url,
    access_key: String,
    order_by: String,
}

impl fmt::Debug for UnsplashClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsplashClient")
            .field("base_url", &self.base_url)
            .field("order_by", &self.order_by)
            .finish_non_exhaustive()
    }
}

impl UnsplashClient {
    pub fn new(access_key: String) -> Self {
        let base_url = Url::parse(UNSPLASH_API_BASE).expect("valid default Unsplash URL");
        Self::with_base_url(access_key, base_url)
    }

    pub fn with_base_url(access_key: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("imgu-sync/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            access_key,
            order_by: "oldest".to_string(),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, UpstreamError> {
        let mut base = cfg.unsplash.api_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)
            .map_err(|e| UpstreamError::InvalidRequest(format!("unsplash.api_url: {e}")))?;
        let mut client = Self::with_base_url(cfg.unsplash.access_key.clone(), base_url);
        client.order_by = cfg.unsplash.order_by.clone();
        Ok(client)
    }

    pub fn build_page_request(&self, page: u32, per_page: u32) -> Result<reqwest::Request, UpstreamError> {
        let endpoint = self
            .base_url
            .join("photos")
            .map_err(|e| UpstreamError::InvalidRequest(format!("invalid Unsplash base URL: {e}")))?;
        let request = self
            .http
            .get(endpoint)
            .query(&[
                ("page", page.to_string()),
                ("per_page", per_page.to_string()),
                ("order_by", self.order_by.clone()),
            ])
            .header("Authorization", format!("Client-ID {}", self.access_key))
            .header("Accept-Version", "v1")
            .build()?;
        Ok(request)
    }
}

/// Read `X-Ratelimit-Limit` / `X-Ratelimit-Remaining`; missing or garbled values stay `None`.
pub fn parse_rate_limit(headers: &HeaderMap) -> RateLimit {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    RateLimit {
        limit: read(RATE_LIMIT_HEADER),
        remaining: read(RATE_REMAINING_HEADER),
    }
}

/// Decode a list response body into photo items, keeping each raw payload.
pub fn parse_photo_list(body: &str) -> Result<Vec<PhotoItem>, UpstreamError> {
    let values: Vec<Value> = serde_json::from_str(body)
        .map_err(|e| UpstreamError::Decode(format!("expected a JSON array of photos: {e}")))?;
    values
        .into_iter()
        .map(|v| PhotoItem::from_value(v).map_err(|e| UpstreamError::Decode(e.to_string())))
        .collect()
}

#[async_trait]
impl PhotoSource for UnsplashClient {
    #[instrument(skip(self))]
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<PhotoPage, UpstreamError> {
        if page == 0 || per_page == 0 {
            return Err(UpstreamError::InvalidRequest(format!(
                "page ({page}) and per_page ({per_page}) must be >= 1"
            )));
        }
        let request = self.build_page_request(page, per_page)?;
        debug!(url = %request.url(), "fetching catalog page");

        let res = self.http.execute(request).await?;
        let status = res.status();
        let rate_limit = parse_rate_limit(res.headers());

        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, ?rate_limit, "Unsplash API error: {}", body);
            return Err(UpstreamError::Status {
                status_code: status.as_u16(),
                body,
                rate_limit,
            });
        }

        let body = res.text().await?;
        let items = parse_photo_list(&body)?;
        info!(
            page,
            count = items.len(),
            limit = ?rate_limit.limit,
            remaining = ?rate_limit.remaining,
            "fetched catalog page"
        );
        Ok(PhotoPage { items, rate_limit })
    }

    #[instrument(skip(self))]
    async fn fetch_raw(&self, url: &str) -> Result<RawImage, UpstreamError> {
        let res = self.http.get(url).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status_code: status.as_u16(),
                body,
                rate_limit: RateLimit::default(),
            });
        }
        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty());
        let bytes = res.bytes().await?.to_vec();
        debug!(size = bytes.len(), ?content_type, "downloaded image");
        Ok(RawImage {
            bytes,
            content_type,
        })
    }
}
