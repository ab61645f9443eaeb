//! Cloud storage hand-off
//!
//! [`ObjectStorage`] is the port the pipeline uploads through;
//! [`ObjectStoreBackend`] implements it over the `object_store` crate (S3 in
//! production, in-memory for local runs). [`StorageAdapter`] adds the
//! upload-then-delete-local policy on top.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{Attribute, AttributeValue, Attributes, ObjectStore, PutOptions, PutPayload};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ImageFormat, StorageConfig};
use crate::utils::random_hex;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("storage configuration invalid: {0}")]
    Config(String),
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("local file unreadable: {0}")]
    LocalRead(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAttributes {
    pub content_type: String,
    pub cache_control: String,
    pub metadata: BTreeMap<String, String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `body` under `key` and return its public URL.
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        attributes: &UploadAttributes,
    ) -> Result<String, StorageError>;

    async fn health_check(&self) -> bool;
}

pub struct ObjectStoreBackend {
    inner: Arc<dyn ObjectStore>,
    public_base_url: String,
}

impl ObjectStoreBackend {
    /// S3 backend. Credentials come from the standard `AWS_*` environment.
    pub fn s3(config: &StorageConfig) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(store),
            public_base_url: config.public_base_url(),
        })
    }

    pub fn in_memory(public_base_url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(InMemory::new()),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn fetch(&self, key: &str) -> Result<Bytes, StorageError> {
        let result = self
            .inner
            .get(&StorePath::from(key))
            .await
            .map_err(|e| StorageError::NotFound(e.to_string()))?;
        result
            .bytes()
            .await
            .map_err(|e| StorageError::NotFound(e.to_string()))
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

#[async_trait]
impl ObjectStorage for ObjectStoreBackend {
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        attributes: &UploadAttributes,
    ) -> Result<String, StorageError> {
        let mut attrs = Attributes::new();
        attrs.insert(
            Attribute::ContentType,
            AttributeValue::from(attributes.content_type.clone()),
        );
        attrs.insert(
            Attribute::CacheControl,
            AttributeValue::from(attributes.cache_control.clone()),
        );
        for (name, value) in &attributes.metadata {
            attrs.insert(
                Attribute::Metadata(name.clone().into()),
                AttributeValue::from(value.clone()),
            );
        }

        let mut options = PutOptions::default();
        options.attributes = attrs;

        self.inner
            .put_opts(&StorePath::from(key), PutPayload::from(body), options)
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;

        Ok(self.public_url(key))
    }

    async fn health_check(&self) -> bool {
        match self.inner.list_with_delimiter(None).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Storage health check failed: {}", e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub success: bool,
    pub url: Option<String>,
    pub key: String,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct StorageAdapter {
    backend: Arc<dyn ObjectStorage>,
    cache_control: String,
}

impl StorageAdapter {
    pub fn new(backend: Arc<dyn ObjectStorage>, cache_control: impl Into<String>) -> Self {
        Self {
            backend,
            cache_control: cache_control.into(),
        }
    }

    /// Build the adapter from config, or `None` when cloud storage is off.
    pub fn from_config(config: &StorageConfig) -> Result<Option<Self>, StorageError> {
        if !config.enabled {
            return Ok(None);
        }
        let backend = ObjectStoreBackend::s3(config)?;
        info!(bucket = %config.bucket, region = %config.region, "Cloud storage enabled");
        Ok(Some(Self::new(Arc::new(backend), config.cache_control.clone())))
    }

    /// Upload the file at `local_path`; delete it only once the upload
    /// succeeded. Failures are reported in the outcome, never raised.
    pub async fn upload_and_relocate(
        &self,
        local_path: &Path,
        key: &str,
        metadata: BTreeMap<String, String>,
        cache_control: Option<&str>,
    ) -> UploadOutcome {
        let failed = |error: String| UploadOutcome {
            success: false,
            url: None,
            key: key.to_string(),
            error: Some(error),
        };

        let body = match tokio::fs::read(local_path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => return failed(StorageError::LocalRead(e.to_string()).to_string()),
        };

        let attributes = UploadAttributes {
            content_type: content_type_for(key).to_string(),
            cache_control: cache_control.unwrap_or(&self.cache_control).to_string(),
            metadata,
        };

        match self.backend.put(key, body, &attributes).await {
            Ok(url) => {
                if let Err(e) = tokio::fs::remove_file(local_path).await {
                    warn!(path = %local_path.display(), "Uploaded but failed to delete local file: {}", e);
                }
                debug!(key, "Uploaded artifact");
                UploadOutcome {
                    success: true,
                    url: Some(url),
                    key: key.to_string(),
                    error: None,
                }
            }
            Err(e) => {
                warn!(key, "Upload failed, keeping local file: {}", e);
                failed(e.to_string())
            }
        }
    }

    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }
}

/// `thumbnails/{owner}/{yyyy}/{mm}/{dd}/{timestampMs}_{16 hex}.{ext}`
pub fn generate_thumbnail_key(owner_id: &str, format: ImageFormat, now: DateTime<Utc>) -> String {
    format!(
        "thumbnails/{}/{:04}/{:02}/{:02}/{}_{}.{}",
        owner_id,
        now.year(),
        now.month(),
        now.day(),
        now.timestamp_millis(),
        random_hex(8),
        format.extension()
    )
}

pub fn content_type_for(key: &str) -> &'static str {
    let extension = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        _ => "application/octet-stream",
    }
}
