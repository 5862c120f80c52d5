//! Multipart session manager
//!
//! Owns the lifecycle of multipart upload sessions:
//!
//! ```text
//! Uninitiated -> Initiated -> InProgress -> Completed | Aborted | Failed
//! ```
//!
//! Sessions are keyed by their source object key. Each session sits behind
//! its own async mutex; part acknowledgments take it briefly, while
//! completion holds it across the storage call so that no acknowledgment can
//! interleave with an in-flight completion.

use super::keys::KeyMapping;
use super::trigger::ProcessingTrigger;
use crate::error::{MediaError, MediaResult};
use crate::metrics;
use crate::presign::{LinkIssuer, PresignedLink, MAX_PART_NUMBER};
use crate::retry::RetryPolicy;
use crate::s3::CompletedPart;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Content type used when a single-shot request names none
pub const DEFAULT_CONTENT_TYPE: &str = "video/mp4";

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initiated,
    InProgress,
    Completed,
    Aborted,
    Failed,
}

impl SessionStatus {
    /// Terminal sessions accept no further mutation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Aborted | SessionStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initiated => "initiated",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
            SessionStatus::Failed => "failed",
        }
    }
}

/// Ledger slot for one part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartEntry {
    pub part_number: u32,
    /// Set once storage has acknowledged the part's bytes
    pub e_tag: Option<String>,
}

/// Serializable view of a multipart upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub object_key: String,
    pub derived_key: String,
    pub file_name: String,
    pub content_type: String,
    pub upload_id: Option<String>,
    pub status: SessionStatus,
    pub expected_parts: Option<u32>,
    /// Sorted by part number, unique per part number
    pub parts: Vec<PartEntry>,
    pub created_at: DateTime<Utc>,
    /// When the session reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    /// Number of parts completion will require
    ///
    /// The declared count when there is one, otherwise the highest part
    /// number seen so far.
    pub fn part_count(&self) -> u32 {
        self.expected_parts
            .or_else(|| self.parts.last().map(|p| p.part_number))
            .unwrap_or(0)
    }

    /// Part numbers in `1..=N` without an acknowledged eTag
    ///
    /// A session that has seen no parts at all is missing part 1.
    pub fn missing_parts(&self) -> Vec<u32> {
        let count = self.part_count().max(1);
        (1..=count)
            .filter(|n| !self.is_acknowledged(*n))
            .collect()
    }

    pub fn is_acknowledged(&self, part_number: u32) -> bool {
        self.slot(part_number)
            .map(|i| self.parts[i].e_tag.is_some())
            .unwrap_or(false)
    }

    /// Total acknowledged parts
    pub fn acknowledged_count(&self) -> usize {
        self.parts.iter().filter(|p| p.e_tag.is_some()).count()
    }

    /// Ordered part list for the completion call
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        self.parts
            .iter()
            .filter_map(|p| {
                p.e_tag.as_ref().map(|etag| CompletedPart {
                    part_number: p.part_number,
                    etag: etag.clone(),
                })
            })
            .collect()
    }

    fn slot(&self, part_number: u32) -> Result<usize, usize> {
        self.parts
            .binary_search_by_key(&part_number, |p| p.part_number)
    }

    fn touch_part(&mut self, part_number: u32) {
        if let Err(i) = self.slot(part_number) {
            self.parts.insert(
                i,
                PartEntry {
                    part_number,
                    e_tag: None,
                },
            );
        }
    }

    fn record_part(&mut self, part_number: u32, e_tag: String) {
        match self.slot(part_number) {
            Ok(i) => self.parts[i].e_tag = Some(e_tag),
            Err(i) => self.parts.insert(
                i,
                PartEntry {
                    part_number,
                    e_tag: Some(e_tag),
                },
            ),
        }
    }

    fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    fn ensure_open(&self) -> MediaResult<()> {
        if self.status.is_terminal() {
            return Err(MediaError::SessionClosed {
                key: self.object_key.clone(),
                status: self.status.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn ensure_within_declared(&self, part_number: u32) -> MediaResult<()> {
        if part_number < 1 || part_number > MAX_PART_NUMBER {
            return Err(MediaError::InvalidArgument(format!(
                "part number {} outside 1..={}",
                part_number, MAX_PART_NUMBER
            )));
        }
        if let Some(expected) = self.expected_parts {
            if part_number > expected {
                return Err(MediaError::Validation(format!(
                    "part {} exceeds declared part count {}",
                    part_number, expected
                )));
            }
        }
        Ok(())
    }
}

/// Single-shot upload grant: keys plus the put link
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleShotTicket {
    pub object_key: String,
    pub derived_key: String,
    pub content_type: String,
    pub link: PresignedLink,
}

/// Result of a successful completion
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedUpload {
    pub object_key: String,
    pub derived_key: String,
    pub upload_id: String,
    pub part_count: u32,
    /// Whether the processing trigger accepted the hand-off
    pub queued: bool,
}

/// Multipart session manager
pub struct SessionManager {
    issuer: LinkIssuer,
    /// Signs part links without retrying, for callers that retry themselves
    single_attempt: LinkIssuer,
    keys: KeyMapping,
    trigger: Arc<dyn ProcessingTrigger>,
    allowed_content_types: Vec<String>,
    sessions: DashMap<String, Arc<Mutex<UploadSession>>>,
}

impl SessionManager {
    pub fn new(
        issuer: LinkIssuer,
        keys: KeyMapping,
        trigger: Arc<dyn ProcessingTrigger>,
        allowed_content_types: Vec<String>,
    ) -> Self {
        Self {
            single_attempt: issuer.with_retry(RetryPolicy::none()),
            issuer,
            keys,
            trigger,
            allowed_content_types: allowed_content_types
                .into_iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            sessions: DashMap::new(),
        }
    }

    pub fn issuer(&self) -> &LinkIssuer {
        &self.issuer
    }

    pub fn keys(&self) -> &KeyMapping {
        &self.keys
    }

    /// Number of sessions held in memory
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Keys of all sessions held in memory
    pub fn session_keys(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    // ========================================================================
    // Multipart lifecycle
    // ========================================================================

    /// Start a multipart upload
    ///
    /// A failed storage call surfaces as `UploadInit` and is not retried.
    #[tracing::instrument(
        name = "session.init",
        skip(self),
        fields(file_name = %file_name, content_type = %content_type),
        err
    )]
    pub async fn init(&self, file_name: &str, content_type: &str) -> MediaResult<UploadSession> {
        if file_name.trim().is_empty() {
            return Err(MediaError::Validation("fileName is required".into()));
        }
        self.check_content_type(content_type)?;

        let keys = self.keys.assign(Some(file_name));
        let upload_id = self
            .issuer
            .store()
            .create_multipart_upload(&keys.source_key, content_type)
            .await
            .map_err(|e| MediaError::UploadInit(e.to_string()))?;

        let session = UploadSession {
            object_key: keys.source_key.clone(),
            derived_key: keys.derived_key,
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            upload_id: Some(upload_id),
            status: SessionStatus::Initiated,
            expected_parts: None,
            parts: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        };

        self.sessions.insert(
            keys.source_key.clone(),
            Arc::new(Mutex::new(session.clone())),
        );
        metrics::record_session("initiated");

        tracing::info!(
            s3.key = %session.object_key,
            upload_id = ?session.upload_id,
            "Multipart session initiated"
        );

        Ok(session)
    }

    /// Fix the number of parts completion will require
    #[tracing::instrument(name = "session.declare_part_count", skip(self), err)]
    pub async fn declare_part_count(&self, key: &str, part_count: u32) -> MediaResult<()> {
        if part_count < 1 || part_count > MAX_PART_NUMBER {
            return Err(MediaError::Validation(format!(
                "part count {} outside 1..={}",
                part_count, MAX_PART_NUMBER
            )));
        }

        let entry = self.entry(key)?;
        let mut session = entry.lock().await;
        session.ensure_open()?;

        if let Some(highest) = session.parts.last().map(|p| p.part_number) {
            if highest > part_count {
                return Err(MediaError::Validation(format!(
                    "part {} already recorded beyond declared count {}",
                    highest, part_count
                )));
            }
        }

        session.expected_parts = Some(part_count);
        Ok(())
    }

    /// Issue an upload link for one part
    ///
    /// Requesting the same part again is allowed; storage keeps the latest
    /// upload for a part number.
    #[tracing::instrument(
        name = "session.request_part_link",
        skip(self),
        fields(s3.key = %key, part_number = part_number),
        err
    )]
    pub async fn request_part_link(&self, key: &str, part_number: u32) -> MediaResult<PresignedLink> {
        self.part_link(&self.issuer, key, part_number).await
    }

    /// Like [`SessionManager::request_part_link`] with a single signing attempt
    pub async fn request_part_link_once(
        &self,
        key: &str,
        part_number: u32,
    ) -> MediaResult<PresignedLink> {
        self.part_link(&self.single_attempt, key, part_number).await
    }

    async fn part_link(
        &self,
        issuer: &LinkIssuer,
        key: &str,
        part_number: u32,
    ) -> MediaResult<PresignedLink> {
        let entry = self.entry(key)?;

        let upload_id = {
            let session = entry.lock().await;
            session.ensure_open()?;
            session.ensure_within_declared(part_number)?;
            session.upload_id.clone().ok_or_else(|| {
                MediaError::Validation(format!("session {} has no upload id", key))
            })?
        };

        let link = issuer
            .issue_part_link(key, &upload_id, part_number, issuer.ttls().part)
            .await?;

        let mut session = entry.lock().await;
        if !session.status.is_terminal() {
            session.touch_part(part_number);
            session.status = SessionStatus::InProgress;
        }

        Ok(link)
    }

    /// Record the eTag storage returned for a part
    ///
    /// Parts may be acknowledged in any order. Acknowledging a part twice
    /// overwrites its eTag.
    #[tracing::instrument(
        name = "session.acknowledge_part",
        skip(self, e_tag),
        fields(s3.key = %key, part_number = part_number),
        err
    )]
    pub async fn acknowledge_part(
        &self,
        key: &str,
        part_number: u32,
        e_tag: &str,
    ) -> MediaResult<()> {
        if e_tag.trim().is_empty() {
            return Err(MediaError::Validation("eTag is required".into()));
        }

        let entry = self.entry(key)?;
        let mut session = entry.lock().await;
        session.ensure_open()?;
        session.ensure_within_declared(part_number)?;

        session.record_part(part_number, e_tag.to_string());
        session.status = SessionStatus::InProgress;

        tracing::debug!(
            acknowledged = session.acknowledged_count(),
            "Part acknowledged"
        );
        Ok(())
    }

    /// Finalize the upload
    ///
    /// Fails with `IncompleteUpload` (session unchanged) unless every part in
    /// `1..=N` is acknowledged. A storage rejection moves the session to
    /// `Failed`; an unavailable store leaves it open for another attempt.
    #[tracing::instrument(name = "session.complete", skip(self), fields(s3.key = %key), err)]
    pub async fn complete(&self, key: &str) -> MediaResult<CompletedUpload> {
        let entry = self.entry(key)?;
        let mut session = entry.lock().await;
        session.ensure_open()?;

        let missing = session.missing_parts();
        if !missing.is_empty() {
            return Err(MediaError::IncompleteUpload { missing });
        }

        let upload_id = session.upload_id.clone().ok_or_else(|| {
            MediaError::Validation(format!("session {} has no upload id", key))
        })?;
        let parts = session.completed_parts();
        let part_count = parts.len() as u32;

        if let Err(e) = self.issuer.issue_complete(key, &upload_id, &parts).await {
            metrics::record_error(e.kind().as_str());
            if !matches!(e, MediaError::StorageUnavailable(_)) {
                session.finish(SessionStatus::Failed);
                metrics::record_session("failed");
                tracing::error!(error = %e, upload_id = %upload_id, "Multipart completion rejected");
            }
            return Err(e);
        }

        session.finish(SessionStatus::Completed);
        metrics::record_session_completed(parts.len());

        let object_key = session.object_key.clone();
        let derived_key = session.derived_key.clone();
        drop(session);

        let queued = self.enqueue(&object_key, &derived_key).await;

        tracing::info!(
            upload_id = %upload_id,
            parts = part_count,
            "Multipart upload completed"
        );

        Ok(CompletedUpload {
            object_key,
            derived_key,
            upload_id,
            part_count,
            queued,
        })
    }

    /// Abort the upload
    ///
    /// The session ends `Aborted` even when the storage call fails; the
    /// orphaned upload is then left for out-of-band cleanup.
    #[tracing::instrument(name = "session.abort", skip(self), fields(s3.key = %key), err)]
    pub async fn abort(&self, key: &str) -> MediaResult<()> {
        let entry = self.entry(key)?;
        let mut session = entry.lock().await;

        match session.status {
            SessionStatus::Aborted => return Ok(()),
            SessionStatus::Completed | SessionStatus::Failed => session.ensure_open()?,
            SessionStatus::Initiated | SessionStatus::InProgress => {}
        }

        if let Some(upload_id) = session.upload_id.clone() {
            if let Err(e) = self.issuer.issue_abort(key, &upload_id).await {
                metrics::record_error(e.kind().as_str());
                tracing::warn!(
                    error = %e,
                    upload_id = %upload_id,
                    "Storage abort failed, upload left for out-of-band cleanup"
                );
            }
        }

        session.finish(SessionStatus::Aborted);
        metrics::record_session("aborted");
        Ok(())
    }

    // ========================================================================
    // Single-shot path
    // ========================================================================

    /// Assign keys and a put link for a single-shot upload
    #[tracing::instrument(name = "session.single_shot", skip(self), err)]
    pub async fn init_single_shot(
        &self,
        file_name: Option<&str>,
        content_type: Option<&str>,
    ) -> MediaResult<SingleShotTicket> {
        let content_type = content_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        self.check_content_type(content_type)?;

        let keys = self.keys.assign(file_name);
        let link = self
            .issuer
            .issue_put_link(&keys.source_key, content_type, self.issuer.ttls().put)
            .await?;

        Ok(SingleShotTicket {
            object_key: keys.source_key,
            derived_key: keys.derived_key,
            content_type: content_type.to_string(),
            link,
        })
    }

    /// Hand a finished single-shot upload to the processing pipeline
    pub async fn finish_single_shot(&self, ticket: &SingleShotTicket) -> bool {
        metrics::record_session("single_shot");
        self.enqueue(&ticket.object_key, &ticket.derived_key).await
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Snapshot of a session
    pub async fn session(&self, key: &str) -> MediaResult<UploadSession> {
        let entry = self.entry(key)?;
        let session = entry.lock().await;
        Ok(session.clone())
    }

    /// Parts completion is still waiting for
    pub async fn missing_parts(&self, key: &str) -> MediaResult<Vec<u32>> {
        let entry = self.entry(key)?;
        let session = entry.lock().await;
        Ok(session.missing_parts())
    }

    /// Evict a terminal session
    pub async fn forget(&self, key: &str) -> MediaResult<UploadSession> {
        let entry = self.entry(key)?;
        let session = entry.lock().await.clone();
        if !session.status.is_terminal() {
            return Err(MediaError::Validation(format!(
                "session {} is still {}",
                key,
                session.status.as_str()
            )));
        }
        self.sessions.remove(key);
        Ok(session)
    }

    /// Evict terminal sessions that finished at least `retention` ago
    ///
    /// Sessions whose lock is held are skipped and picked up by a later
    /// sweep. Returns the number evicted.
    pub fn evict_finished(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let candidates: Vec<(String, Arc<Mutex<UploadSession>>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut evicted = 0;
        for (key, entry) in candidates {
            let expired = match entry.try_lock() {
                Ok(session) => session
                    .finished_at
                    .map(|at| session.status.is_terminal() && at <= cutoff)
                    .unwrap_or(false),
                Err(_) => false,
            };
            if expired && self.sessions.remove(&key).is_some() {
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.sessions.len(), "Evicted finished sessions");
        }
        evicted
    }

    fn entry(&self, key: &str) -> MediaResult<Arc<Mutex<UploadSession>>> {
        self.sessions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MediaError::SessionNotFound(key.to_string()))
    }

    fn check_content_type(&self, content_type: &str) -> MediaResult<()> {
        let normalized = content_type.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(MediaError::Validation("fileType is required".into()));
        }
        if self.allowed_content_types.is_empty()
            || self
                .allowed_content_types
                .iter()
                .any(|allowed| normalized.starts_with(allowed.as_str()))
        {
            return Ok(());
        }
        Err(MediaError::Validation(format!(
            "content type '{}' is not accepted",
            content_type
        )))
    }

    async fn enqueue(&self, source_key: &str, derived_key: &str) -> bool {
        match self.trigger.enqueue(source_key, derived_key).await {
            Ok(()) => true,
            Err(e) => {
                metrics::record_error(e.kind().as_str());
                tracing::error!(
                    error = %e,
                    source_key = source_key,
                    "Processing trigger rejected hand-off"
                );
                false
            }
        }
    }
}
