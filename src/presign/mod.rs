//! Presigned-link issuance
//!
//! [`LinkIssuer`] wraps the storage capability to mint time-boxed,
//! operation-scoped URLs and to run the terminal multipart operations. It
//! holds no mutable state and is cheap to clone across sessions.

use crate::config::LinkConfig;
use crate::error::{MediaError, MediaResult};
use crate::metrics;
use crate::retry::{retry_transient, RetryPolicy};
use crate::s3::{CompletedPart, ObjectStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Largest part number the multipart protocol accepts
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Storage operation a link authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkOperation {
    PutObject,
    UploadPart,
    GetObject,
}

impl LinkOperation {
    fn as_str(&self) -> &'static str {
        match self {
            LinkOperation::PutObject => "put_object",
            LinkOperation::UploadPart => "upload_part",
            LinkOperation::GetObject => "get_object",
        }
    }
}

/// A time-boxed URL authorizing one storage operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedLink {
    pub url: String,
    pub operation: LinkOperation,
    pub expires_at: DateTime<Utc>,
}

impl PresignedLink {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Default link lifetimes per operation
#[derive(Debug, Clone)]
pub struct LinkTtls {
    pub put: Duration,
    pub part: Duration,
    pub get: Duration,
}

impl From<&LinkConfig> for LinkTtls {
    fn from(config: &LinkConfig) -> Self {
        Self {
            put: Duration::from_secs(config.put_ttl_secs),
            part: Duration::from_secs(config.part_ttl_secs),
            get: Duration::from_secs(config.get_ttl_secs),
        }
    }
}

impl Default for LinkTtls {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

/// Presigned-link issuer
#[derive(Clone)]
pub struct LinkIssuer {
    store: Arc<dyn ObjectStore>,
    ttls: LinkTtls,
    retry: RetryPolicy,
}

impl LinkIssuer {
    pub fn new(store: Arc<dyn ObjectStore>, ttls: LinkTtls, retry: RetryPolicy) -> Self {
        Self { store, ttls, retry }
    }

    /// Same store and lifetimes with a different retry policy
    pub fn with_retry(&self, retry: RetryPolicy) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ttls: self.ttls.clone(),
            retry,
        }
    }

    /// Configured default lifetimes
    pub fn ttls(&self) -> &LinkTtls {
        &self.ttls
    }

    /// The underlying storage capability
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Link for a single-shot upload of the whole object
    pub async fn issue_put_link(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> MediaResult<PresignedLink> {
        require_key(key)?;
        if content_type.trim().is_empty() {
            return Err(MediaError::InvalidArgument(
                "content type must not be empty".into(),
            ));
        }

        let expires_at = expiry(ttl)?;
        let url = retry_transient(&self.retry, "sign_put_object", |_| async {
            Ok(self.store.sign_put_object(key, content_type, ttl).await?)
        })
        .await?;

        Ok(issued(url, LinkOperation::PutObject, expires_at))
    }

    /// Link for one part of a multipart upload
    pub async fn issue_part_link(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> MediaResult<PresignedLink> {
        require_key(key)?;
        if part_number < 1 || part_number > MAX_PART_NUMBER {
            return Err(MediaError::InvalidArgument(format!(
                "part number {} outside 1..={}",
                part_number, MAX_PART_NUMBER
            )));
        }
        if upload_id.is_empty() {
            return Err(MediaError::InvalidArgument(
                "upload id must not be empty".into(),
            ));
        }

        let expires_at = expiry(ttl)?;
        let url = retry_transient(&self.retry, "sign_part_upload", |_| async {
            Ok(self
                .store
                .sign_part_upload(key, upload_id, part_number, ttl)
                .await?)
        })
        .await?;

        Ok(issued(url, LinkOperation::UploadPart, expires_at))
    }

    /// Link for downloading an existing object
    ///
    /// The object is probed first so that links are never issued for keys
    /// that do not exist. Transient probe failures are retried.
    pub async fn issue_get_link(&self, key: &str, ttl: Duration) -> MediaResult<PresignedLink> {
        require_key(key)?;
        retry_transient(&self.retry, "issue_get_link", |_| self.probe_get_link(key, ttl)).await
    }

    /// One existence probe followed by signing, without retries
    pub(crate) async fn probe_get_link(
        &self,
        key: &str,
        ttl: Duration,
    ) -> MediaResult<PresignedLink> {
        if !self.store.head_object(key).await? {
            return Err(MediaError::NotFound(key.to_string()));
        }

        let expires_at = expiry(ttl)?;
        let url = self.store.sign_get_object(key, ttl).await?;
        Ok(issued(url, LinkOperation::GetObject, expires_at))
    }

    /// Finalize a multipart upload. Never retried: the caller decides.
    pub async fn issue_complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> MediaResult<()> {
        self.store
            .complete_multipart_upload(key, upload_id, parts)
            .await
            .map_err(MediaError::from)
    }

    /// Abort a multipart upload, retrying transient failures
    pub async fn issue_abort(&self, key: &str, upload_id: &str) -> MediaResult<()> {
        retry_transient(&self.retry, "abort_multipart_upload", |_| async {
            Ok(self.store.abort_multipart_upload(key, upload_id).await?)
        })
        .await
    }

    /// Delete an object, retrying transient failures
    pub async fn delete_object(&self, key: &str) -> MediaResult<()> {
        require_key(key)?;
        retry_transient(&self.retry, "delete_object", |_| async {
            Ok(self.store.delete_object(key).await?)
        })
        .await
    }
}

fn require_key(key: &str) -> MediaResult<()> {
    if key.trim().is_empty() {
        return Err(MediaError::InvalidArgument(
            "object key must not be empty".into(),
        ));
    }
    Ok(())
}

fn expiry(ttl: Duration) -> MediaResult<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|_| MediaError::InvalidArgument(format!("link ttl {:?} out of range", ttl)))?;
    Ok(Utc::now() + ttl)
}

fn issued(url: String, operation: LinkOperation, expires_at: DateTime<Utc>) -> PresignedLink {
    metrics::record_link_issued(operation.as_str());
    tracing::debug!(
        operation = operation.as_str(),
        expires_at = %expires_at,
        "Issued presigned link"
    );
    PresignedLink {
        url,
        operation,
        expires_at,
    }
}
