//! Chunked transfer driver
//!
//! Drives a whole upload from a local source: picks single-shot or
//! multipart by size, fans part transfers out under a concurrency bound,
//! acknowledges each part with the session manager and finally completes.
//!
//! A part whose transfer keeps failing fails the upload with `Transfer`. The
//! session is left `InProgress` so that [`TransferDriver::resume`] or an
//! explicit abort can follow; the driver never aborts on its own.

use super::partition::{plan_parts, PartRange};
use super::progress::{ProgressTracker, TransferProgress};
use super::session::SessionManager;
use super::transport::{PartTransport, TransportError};
use crate::config::UploadConfig;
use crate::error::{MediaError, MediaResult};
use crate::metrics;
use crate::presign::PresignedLink;
use crate::retry::{retry_transient, RetryPolicy};
use bytes::Bytes;
use futures::stream::{self, TryStreamExt};
use serde::Serialize;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;

/// Bytes to upload
#[derive(Debug, Clone)]
pub enum UploadSource {
    File(PathBuf),
    Memory(Bytes),
}

impl UploadSource {
    /// Total size in bytes
    pub async fn len(&self) -> MediaResult<u64> {
        match self {
            UploadSource::File(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.len())
                .map_err(|e| unreadable(path, e)),
            UploadSource::Memory(bytes) => Ok(bytes.len() as u64),
        }
    }

    /// Read `len` bytes starting at `offset`
    pub async fn read_range(&self, offset: u64, len: u64) -> MediaResult<Bytes> {
        match self {
            UploadSource::File(path) => {
                let mut file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| unreadable(path, e))?;
                file.seek(SeekFrom::Start(offset))
                    .await
                    .map_err(|e| unreadable(path, e))?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf)
                    .await
                    .map_err(|e| unreadable(path, e))?;
                Ok(Bytes::from(buf))
            }
            UploadSource::Memory(bytes) => {
                let start = offset as usize;
                let end = start + len as usize;
                if end > bytes.len() {
                    return Err(MediaError::InvalidArgument(format!(
                        "range {}..{} beyond source of {} bytes",
                        start,
                        end,
                        bytes.len()
                    )));
                }
                Ok(bytes.slice(start..end))
            }
        }
    }

    /// File name of a file source
    pub fn file_name(&self) -> Option<String> {
        match self {
            UploadSource::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            UploadSource::Memory(_) => None,
        }
    }
}

fn unreadable(path: &std::path::Path, e: std::io::Error) -> MediaError {
    MediaError::Validation(format!("cannot read {}: {}", path.display(), e))
}

/// Upload path taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMethod {
    SingleShot,
    Multipart,
}

impl UploadMethod {
    fn as_str(&self) -> &'static str {
        match self {
            UploadMethod::SingleShot => "single_shot",
            UploadMethod::Multipart => "multipart",
        }
    }
}

/// Outcome of a finished upload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub object_key: String,
    pub derived_key: String,
    pub method: UploadMethod,
    pub upload_id: Option<String>,
    pub bytes: u64,
    pub part_count: u32,
    pub queued: bool,
}

/// Chunked transfer driver
pub struct TransferDriver {
    manager: Arc<SessionManager>,
    transport: Arc<dyn PartTransport>,
    config: UploadConfig,
    retry: RetryPolicy,
}

impl TransferDriver {
    pub fn new(
        manager: Arc<SessionManager>,
        transport: Arc<dyn PartTransport>,
        config: UploadConfig,
        retry: RetryPolicy,
    ) -> Self {
        let retry = retry.with_max_attempts(config.max_part_attempts);
        Self {
            manager,
            transport,
            config,
            retry,
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Upload `source`, choosing the path by size
    pub async fn upload(
        &self,
        source: &UploadSource,
        file_name: &str,
        content_type: &str,
        progress: Option<watch::Sender<TransferProgress>>,
    ) -> MediaResult<UploadReport> {
        let total = source.len().await?;
        if total < self.config.multipart_threshold {
            self.upload_single_shot(source, file_name, content_type, progress)
                .await
        } else {
            self.upload_multipart(source, file_name, content_type, progress)
                .await
        }
    }

    /// Upload the whole body through one put link
    #[tracing::instrument(
        name = "driver.single_shot",
        skip(self, source, progress),
        err
    )]
    pub async fn upload_single_shot(
        &self,
        source: &UploadSource,
        file_name: &str,
        content_type: &str,
        progress: Option<watch::Sender<TransferProgress>>,
    ) -> MediaResult<UploadReport> {
        let started = Instant::now();
        let total = source.len().await?;
        let tracker = tracker(total, 1, progress);

        let ticket = self
            .manager
            .init_single_shot(Some(file_name), Some(content_type))
            .await?;
        let body = source.read_range(0, total).await?;

        let issuer = self.manager.issuer();
        let key = ticket.object_key.as_str();
        let signed_type = ticket.content_type.as_str();
        let first_link = ticket.link.clone();

        retry_transient(&self.retry, "single_shot_transfer", |attempt| {
            let body = body.clone();
            let first_link = first_link.clone();
            async move {
                // Links are short-lived; every retry gets a fresh one
                let link = if attempt == 1 {
                    first_link
                } else {
                    issuer
                        .issue_put_link(key, signed_type, issuer.ttls().put)
                        .await?
                };
                self.send(&link, body, Some(signed_type), 1, attempt).await
            }
        })
        .await
        .inspect_err(|_| metrics::record_part_transfer(false, 0))?;

        metrics::record_part_transfer(true, total);
        tracker.part_acknowledged(total);
        let queued = self.manager.finish_single_shot(&ticket).await;
        metrics::record_upload_duration(
            UploadMethod::SingleShot.as_str(),
            started.elapsed().as_secs_f64(),
        );

        tracing::info!(s3.key = %ticket.object_key, bytes = total, "Single-shot upload finished");

        Ok(UploadReport {
            object_key: ticket.object_key,
            derived_key: ticket.derived_key,
            method: UploadMethod::SingleShot,
            upload_id: None,
            bytes: total,
            part_count: 1,
            queued,
        })
    }

    /// Upload through a new multipart session
    #[tracing::instrument(
        name = "driver.multipart",
        skip(self, source, progress),
        err
    )]
    pub async fn upload_multipart(
        &self,
        source: &UploadSource,
        file_name: &str,
        content_type: &str,
        progress: Option<watch::Sender<TransferProgress>>,
    ) -> MediaResult<UploadReport> {
        let started = Instant::now();
        let total = source.len().await?;
        let plan = self.plan(total);

        let session = self.manager.init(file_name, content_type).await?;
        let key = session.object_key.clone();
        self.manager
            .declare_part_count(&key, plan.len() as u32)
            .await?;

        let tracker = tracker(total, plan.len() as u32, progress);
        self.transfer_parts(&key, source, plan, &tracker).await?;

        let report = self.finish(&key, total).await?;
        metrics::record_upload_duration(
            UploadMethod::Multipart.as_str(),
            started.elapsed().as_secs_f64(),
        );
        Ok(report)
    }

    /// Upload only the parts an open session is missing, then complete
    #[tracing::instrument(name = "driver.resume", skip(self, source, progress), err)]
    pub async fn resume(
        &self,
        key: &str,
        source: &UploadSource,
        progress: Option<watch::Sender<TransferProgress>>,
    ) -> MediaResult<UploadReport> {
        let session = self.manager.session(key).await?;
        if session.status.is_terminal() {
            return Err(MediaError::SessionClosed {
                key: key.to_string(),
                status: session.status.as_str().to_string(),
            });
        }

        let total = source.len().await?;
        let plan = self.plan(total);
        match session.expected_parts {
            Some(expected) if expected as usize != plan.len() => {
                return Err(MediaError::Validation(format!(
                    "source splits into {} parts but session {} expects {}",
                    plan.len(),
                    key,
                    expected
                )));
            }
            Some(_) => {}
            None => {
                self.manager
                    .declare_part_count(key, plan.len() as u32)
                    .await?
            }
        }

        let tracker = tracker(total, plan.len() as u32, progress);
        let (done, pending): (Vec<PartRange>, Vec<PartRange>) = plan
            .into_iter()
            .partition(|part| session.is_acknowledged(part.part_number));
        for part in &done {
            tracker.part_acknowledged(part.len);
        }

        tracing::info!(
            s3.key = %key,
            acknowledged = done.len(),
            pending = pending.len(),
            "Resuming multipart upload"
        );

        self.transfer_parts(key, source, pending, &tracker).await?;
        self.finish(key, total).await
    }

    fn plan(&self, total: u64) -> Vec<PartRange> {
        plan_parts(total, self.config.part_size, self.config.min_part_size)
    }

    async fn transfer_parts(
        &self,
        key: &str,
        source: &UploadSource,
        parts: Vec<PartRange>,
        tracker: &ProgressTracker,
    ) -> MediaResult<()> {
        let limit = self.config.concurrent_parts.max(1);

        stream::iter(parts.into_iter().map(Ok::<_, MediaError>))
            .try_for_each_concurrent(limit, |part| async move {
                let etag = self.transfer_part(key, source, part).await?;
                self.manager
                    .acknowledge_part(key, part.part_number, &etag)
                    .await?;
                metrics::record_part_transfer(true, part.len);
                let tick = tracker.part_acknowledged(part.len);
                tracing::debug!(
                    part_number = part.part_number,
                    percent = tick.percent,
                    "Part acknowledged"
                );
                Ok(())
            })
            .await
    }

    #[tracing::instrument(
        name = "driver.transfer_part",
        skip(self, source),
        fields(part_number = part.part_number, upload.bytes = part.len),
        err
    )]
    async fn transfer_part(
        &self,
        key: &str,
        source: &UploadSource,
        part: PartRange,
    ) -> MediaResult<String> {
        let body = source.read_range(part.offset, part.len).await?;

        retry_transient(&self.retry, "part_transfer", |attempt| {
            let body = body.clone();
            async move {
                let link = self
                    .manager
                    .request_part_link_once(key, part.part_number)
                    .await
                    .map_err(|e| match e {
                        MediaError::StorageUnavailable(message) => MediaError::Transfer {
                            part_number: part.part_number,
                            attempts: attempt,
                            message,
                        },
                        other => other,
                    })?;
                self.send(&link, body, None, part.part_number, attempt)
                    .await
            }
        })
        .await
        .inspect_err(|_| metrics::record_part_transfer(false, 0))
    }

    async fn send(
        &self,
        link: &PresignedLink,
        body: Bytes,
        content_type: Option<&str>,
        part_number: u32,
        attempt: u32,
    ) -> MediaResult<String> {
        self.transport
            .put(link, body, content_type)
            .await
            .map_err(|e| match e {
                TransportError::Retryable(message) => MediaError::Transfer {
                    part_number,
                    attempts: attempt,
                    message,
                },
                TransportError::PartTooSmall(message) => MediaError::PartTooSmall(message),
                TransportError::Rejected { code, message, .. } => {
                    MediaError::StorageRejected { code, message }
                }
            })
    }

    async fn finish(&self, key: &str, total: u64) -> MediaResult<UploadReport> {
        let completed = self.manager.complete(key).await?;

        Ok(UploadReport {
            object_key: completed.object_key,
            derived_key: completed.derived_key,
            method: UploadMethod::Multipart,
            upload_id: Some(completed.upload_id),
            bytes: total,
            part_count: completed.part_count,
            queued: completed.queued,
        })
    }
}

fn tracker(
    total: u64,
    parts: u32,
    progress: Option<watch::Sender<TransferProgress>>,
) -> ProgressTracker {
    match progress {
        Some(tx) => ProgressTracker::with_sender(total, parts, tx),
        None => ProgressTracker::new(total, parts),
    }
}
