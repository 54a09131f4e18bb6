use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use reqwest::Url;
use std::fmt;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::R2;

/// Fallback content type when neither the download nor the extension names one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload of {key} failed: {message}")]
    Upload { key: String, message: String },
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` under `key`; an existing object is overwritten.
    async fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError>;
}

/// Cloudflare R2 through the S3 API: region `auto`, custom endpoint, static
/// credentials and path-style addressing.
#[derive(Clone)]
pub struct R2Store {
    client: Client,
    bucket: String,
}

impl fmt::Debug for R2Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("R2Store")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl R2Store {
    pub fn new(cfg: &R2) -> Self {
        let credentials = Credentials::new(
            cfg.access_key_id.clone(),
            cfg.secret_access_key.clone(),
            None,
            None,
            "imgu-sync-static",
        );
        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("auto"))
            .endpoint_url(cfg.endpoint_url.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(s3_config),
            bucket: cfg.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for R2Store {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|err| StoreError::Upload {
                key: key.to_string(),
                message: aws_sdk_s3::error::DisplayErrorContext(&err).to_string(),
            })?;
        debug!(bucket = %self.bucket, "object written");
        Ok(())
    }
}

/// `{category}/{item_id}{ext}`.
pub fn object_key(category: &str, item_id: &str, ext: &str) -> String {
    format!("{category}/{item_id}{ext}")
}

pub fn public_url(prefix: &str, key: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), key)
}

/// Extension from the `fm` query parameter of an image URL, or `default`.
pub fn extension_for_url(url: &str, default: &str) -> String {
    let format = Url::parse(url).ok().and_then(|u| {
        u.query_pairs()
            .find(|(k, _)| k == "fm")
            .map(|(_, v)| v.to_ascii_lowercase())
    });
    match format.as_deref() {
        Some("jpg") | Some("jpeg") => ".jpg".to_string(),
        Some(fm @ ("png" | "webp" | "avif" | "gif")) => format!(".{fm}"),
        _ => default.to_string(),
    }
}

pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "gif" => "image/gif",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(object_key("nature", "abc", ".jpg"), "nature/abc.jpg");
        assert_eq!(
            public_url("https://cdn.example/", "nature/abc.jpg"),
            "https://cdn.example/nature/abc.jpg"
        );
    }

    #[test]
    fn extension_from_format_parameter() {
        let url = "https://images.unsplash.com/photo-1?ixid=x&fm=PNG&w=100";
        assert_eq!(extension_for_url(url, ".jpg"), ".png");
        assert_eq!(extension_for_url("https://x/p?fm=jpeg", ".bin"), ".jpg");
        assert_eq!(extension_for_url("https://x/p?fm=tiff", ".jpg"), ".jpg");
        assert_eq!(extension_for_url("https://x/p", ".jpg"), ".jpg");
        assert_eq!(extension_for_url("not a url", ".jpg"), ".jpg");
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for_extension(".jpg"), "image/jpeg");
        assert_eq!(content_type_for_extension("webp"), "image/webp");
        assert_eq!(content_type_for_extension(".heic"), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn debug_hides_client_credentials() {
        let store = R2Store::new(&R2 {
            endpoint_url: "https://acct.r2.cloudflarestorage.com".into(),
            bucket: "photos".into(),
            public_url_prefix: "https://cdn.example".into(),
            access_key_id: "AKID".into(),
            secret_access_key: "very-secret".into(),
        });
        let printed = format!("{:?}", store);
        assert!(printed.contains("photos"));
        assert!(!printed.contains("very-secret"));
    }
}
