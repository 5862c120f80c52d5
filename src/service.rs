//! Media service
//!
//! The operations exposed to UI collaborators, built once from
//! configuration and a storage client and shared behind an `Arc`.

use crate::config::Config;
use crate::error::{MediaError, MediaResult};
use crate::metrics;
use crate::presign::{LinkIssuer, LinkTtls, PresignedLink};
use crate::retry::RetryPolicy;
use crate::s3::{CompletedPart, ObjectStore};
use crate::upload::{
    CompletedUpload, KeyMapping, ProcessingTrigger, SessionManager, SingleShotTicket,
    UploadSession,
};
use crate::watch::{CompletionWatcher, Watch, WatchCanceller, WatchRequest};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

type WatchRegistry = Arc<DashMap<String, WatchCanceller>>;

/// Removes a watch from the registry when the watch is dropped
struct Registration {
    id: String,
    registry: WatchRegistry,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// UI-facing media operations
pub struct MediaService {
    manager: Arc<SessionManager>,
    watcher: CompletionWatcher,
    config: Config,
    watches: WatchRegistry,
}

impl MediaService {
    /// Build the service from configuration
    pub fn new(
        config: Config,
        store: Arc<dyn ObjectStore>,
        trigger: Arc<dyn ProcessingTrigger>,
    ) -> Self {
        let retry = RetryPolicy::from(&config.storage.retry);
        let issuer = LinkIssuer::new(store, LinkTtls::from(&config.links), retry);
        let manager = SessionManager::new(
            issuer.clone(),
            KeyMapping::new(&config.keys),
            trigger,
            config.upload.allowed_content_types.clone(),
        );

        Self {
            manager: Arc::new(manager),
            watcher: CompletionWatcher::new(issuer),
            config,
            watches: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn watcher(&self) -> &CompletionWatcher {
        &self.watcher
    }

    // ========================================================================
    // Multipart uploads
    // ========================================================================

    /// Start a multipart upload, optionally fixing its part count
    pub async fn init_upload(
        &self,
        file_name: &str,
        content_type: &str,
        part_count: Option<u32>,
    ) -> MediaResult<UploadSession> {
        let session = self
            .manager
            .init(file_name, content_type)
            .await
            .inspect_err(record)?;

        if let Some(count) = part_count {
            if let Err(e) = self
                .manager
                .declare_part_count(&session.object_key, count)
                .await
            {
                // The storage upload exists already; do not leave it behind
                if let Err(abort_err) = self.manager.abort(&session.object_key).await {
                    tracing::warn!(
                        s3.key = %session.object_key,
                        error = %abort_err,
                        "Failed to abort upload after rejected part count"
                    );
                }
                record(&e);
                return Err(e);
            }
            return self.manager.session(&session.object_key).await;
        }

        Ok(session)
    }

    /// Link for one part; a supplied upload id must match the session
    pub async fn request_part_link(
        &self,
        key: &str,
        part_number: u32,
        upload_id: Option<&str>,
    ) -> MediaResult<PresignedLink> {
        if let Some(upload_id) = upload_id {
            let session = self.manager.session(key).await.inspect_err(record)?;
            if session.upload_id.as_deref() != Some(upload_id) {
                let e = MediaError::Validation(format!(
                    "upload id {} does not belong to {}",
                    upload_id, key
                ));
                record(&e);
                return Err(e);
            }
        }

        self.manager
            .request_part_link(key, part_number)
            .await
            .inspect_err(record)
    }

    pub async fn acknowledge_part(&self, key: &str, part_number: u32, e_tag: &str) -> MediaResult<()> {
        self.manager
            .acknowledge_part(key, part_number, e_tag)
            .await
            .inspect_err(record)
    }

    /// Complete an upload, first recording any parts the caller supplies
    pub async fn complete_upload(
        &self,
        key: &str,
        parts: &[CompletedPart],
    ) -> MediaResult<CompletedUpload> {
        for part in parts {
            self.manager
                .acknowledge_part(key, part.part_number, &part.etag)
                .await
                .inspect_err(record)?;
        }
        self.manager.complete(key).await.inspect_err(record)
    }

    pub async fn abort_upload(&self, key: &str) -> MediaResult<()> {
        self.manager.abort(key).await.inspect_err(record)
    }

    pub async fn session(&self, key: &str) -> MediaResult<UploadSession> {
        self.manager.session(key).await
    }

    /// Drop a finished session from memory right away
    pub async fn forget_session(&self, key: &str) -> MediaResult<UploadSession> {
        self.manager.forget(key).await.inspect_err(record)
    }

    /// Evict sessions finished longer ago than `upload.session_retention_secs`
    pub fn sweep_sessions(&self) -> usize {
        self.manager.evict_finished(self.session_retention())
    }

    /// Periodically evict finished sessions until the handle is aborted
    pub fn spawn_session_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let period = Duration::from_secs((self.config.upload.session_retention_secs / 2).max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.sweep_sessions();
            }
        })
    }

    fn session_retention(&self) -> chrono::Duration {
        let secs = self
            .config
            .upload
            .session_retention_secs
            .min(crate::config::MAX_SESSION_RETENTION_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    // ========================================================================
    // Single-shot uploads and objects
    // ========================================================================

    pub async fn issue_single_shot(
        &self,
        file_name: Option<&str>,
        content_type: Option<&str>,
    ) -> MediaResult<SingleShotTicket> {
        self.manager
            .init_single_shot(file_name, content_type)
            .await
            .inspect_err(record)
    }

    /// One existence check on a processed object
    ///
    /// `Ok(None)` while the object is still being produced.
    pub async fn check_download(&self, key: &str) -> MediaResult<Option<PresignedLink>> {
        if key.trim().is_empty() {
            return Err(MediaError::Validation("fileKey is required".into()));
        }
        self.watcher.probe_once(key).await.inspect_err(record)
    }

    pub async fn delete_object(&self, key: &str) -> MediaResult<()> {
        self.manager
            .issuer()
            .delete_object(key)
            .await
            .inspect_err(record)
    }

    // ========================================================================
    // Watches
    // ========================================================================

    /// Watch request for a derived key with configured defaults
    pub fn watch_request(&self, source_key: &str, derived_key: &str) -> WatchRequest {
        WatchRequest::new(source_key, derived_key, &self.config.watch)
    }

    /// Start a registered watch; it can be cancelled by id until dropped
    pub fn start_watch(&self, request: WatchRequest) -> MediaResult<(String, Watch)> {
        let mut watch = self.watcher.watch(request).inspect_err(record)?;
        let id = uuid::Uuid::new_v4().to_string();

        self.watches.insert(id.clone(), watch.canceller());
        watch.attach(Registration {
            id: id.clone(),
            registry: Arc::clone(&self.watches),
        });

        Ok((id, watch))
    }

    /// Cancel a watch by id. Returns `false` for unknown ids.
    pub fn cancel_watch(&self, id: &str) -> bool {
        match self.watches.remove(id) {
            Some((_, canceller)) => {
                canceller.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_watches(&self) -> usize {
        self.watches.len()
    }
}

fn record(e: &MediaError) {
    metrics::record_error(e.kind().as_str());
}
