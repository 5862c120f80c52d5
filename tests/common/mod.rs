//! Shared test fixtures
//!
//! In-memory storage, transport and trigger doubles. Each integration test
//! binary pulls in only what it needs.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use mizuchi_media::config::Config;
use mizuchi_media::error::MediaResult;
use mizuchi_media::presign::PresignedLink;
use mizuchi_media::s3::{CompletedPart, ObjectStore, StorageError};
use mizuchi_media::service::MediaService;
use mizuchi_media::upload::{PartTransport, ProcessingTrigger, TransportError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub const MIB: u64 = 1024 * 1024;

/// Configuration for tests: fast retries, small parts, short watch timings
pub fn test_config() -> Config {
    let mut config = Config::for_bucket("test-bucket", "us-east-1");
    config.server.address = "127.0.0.1:0".to_string();
    config.storage.retry.max_retries = 2;
    config.storage.retry.initial_backoff_ms = 1;
    config.storage.retry.max_backoff_ms = 4;
    config.upload.min_part_size = 5 * MIB;
    config.upload.part_size = 5 * MIB;
    config.upload.multipart_threshold = 10 * MIB;
    config.upload.concurrent_parts = 2;
    config.upload.max_part_attempts = 3;
    config.watch.poll_interval_ms = 1000;
    config.watch.timeout_ms = 5000;
    config
}

pub fn service(store: Arc<MemoryStore>, trigger: Arc<RecordingTrigger>) -> Arc<MediaService> {
    Arc::new(MediaService::new(test_config(), store, trigger))
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Default)]
struct StoreState {
    objects: HashSet<String>,
    uploads: HashMap<String, String>,
    next_upload: u32,
    head_probes: HashMap<String, u32>,
    appear_after: HashMap<String, u32>,
    head_failures: VecDeque<StorageError>,
    create_failure: Option<StorageError>,
    complete_failure: Option<StorageError>,
    complete_gate: Option<CompleteGate>,
    abort_failure: Option<StorageError>,
    sign_failures: HashMap<u32, StorageError>,
    part_signs: HashMap<u32, u32>,
    completed: Vec<(String, String, Vec<CompletedPart>)>,
    aborted: Vec<(String, String)>,
    deleted: Vec<String>,
}

/// Holds completion calls inside the store until released
#[derive(Clone, Default)]
pub struct CompleteGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl CompleteGate {
    /// Resolves once a completion call is parked in the store
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Object store that keeps everything in memory
///
/// Signed URLs use a `memory://` scheme understood by [`MemoryTransport`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, key: &str) {
        self.state.lock().objects.insert(key.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().objects.contains(key)
    }

    /// `key` starts to exist on the `probes`-th head request
    pub fn appear_after(&self, key: &str, probes: u32) {
        self.state
            .lock()
            .appear_after
            .insert(key.to_string(), probes);
    }

    /// Fail the next head request with `err`
    pub fn fail_next_head(&self, err: StorageError) {
        self.state.lock().head_failures.push_back(err);
    }

    pub fn fail_create(&self, err: StorageError) {
        self.state.lock().create_failure = Some(err);
    }

    pub fn fail_complete(&self, err: StorageError) {
        self.state.lock().complete_failure = Some(err);
    }

    pub fn clear_complete_failure(&self) {
        self.state.lock().complete_failure = None;
    }

    /// Park every completion call until [`CompleteGate::release`]
    pub fn hold_complete(&self) -> CompleteGate {
        let gate = CompleteGate::default();
        self.state.lock().complete_gate = Some(gate.clone());
        gate
    }

    /// Fail every signing request for `part_number` with `err`
    pub fn fail_sign_part(&self, part_number: u32, err: StorageError) {
        self.state.lock().sign_failures.insert(part_number, err);
    }

    /// Signing requests seen for `part_number`, failed ones included
    pub fn part_signs(&self, part_number: u32) -> u32 {
        self.state
            .lock()
            .part_signs
            .get(&part_number)
            .copied()
            .unwrap_or(0)
    }

    pub fn fail_abort(&self, err: StorageError) {
        self.state.lock().abort_failure = Some(err);
    }

    pub fn head_probes(&self, key: &str) -> u32 {
        self.state
            .lock()
            .head_probes
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn uploads_created(&self) -> u32 {
        self.state.lock().next_upload
    }

    /// Part lists submitted to successful completions, in call order
    pub fn completed(&self) -> Vec<(String, String, Vec<CompletedPart>)> {
        self.state.lock().completed.clone()
    }

    pub fn aborted(&self) -> Vec<(String, String)> {
        self.state.lock().aborted.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create_multipart_upload(
        &self,
        key: &str,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let mut state = self.state.lock();
        if let Some(err) = state.create_failure.take() {
            return Err(err);
        }
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(upload_id.clone(), key.to_string());
        Ok(upload_id)
    }

    async fn sign_part_upload(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let mut state = self.state.lock();
        *state.part_signs.entry(part_number).or_insert(0) += 1;
        if let Some(err) = state.sign_failures.get(&part_number) {
            return Err(err.clone());
        }
        Ok(format!(
            "memory://test-bucket/{}?partNumber={}&uploadId={}&expires={}",
            key,
            part_number,
            upload_id,
            ttl.as_secs()
        ))
    }

    async fn sign_put_object(
        &self,
        key: &str,
        _content_type: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        Ok(format!(
            "memory://test-bucket/{}?expires={}",
            key,
            ttl.as_secs()
        ))
    }

    async fn sign_get_object(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        Ok(format!(
            "memory://test-bucket/{}?download=1&expires={}",
            key,
            ttl.as_secs()
        ))
    }

    async fn head_object(&self, key: &str) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        let probes = {
            let count = state.head_probes.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if let Some(err) = state.head_failures.pop_front() {
            return Err(err);
        }
        if let Some(after) = state.appear_after.get(key).copied() {
            if probes >= after {
                state.objects.insert(key.to_string());
            }
        }
        Ok(state.objects.contains(key))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        let gate = self.state.lock().complete_gate.clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let mut state = self.state.lock();
        if let Some(err) = state.complete_failure.clone() {
            return Err(err);
        }
        if state.uploads.remove(upload_id).is_none() {
            return Err(StorageError::Rejected {
                code: "NoSuchUpload".into(),
                message: format!("unknown upload {}", upload_id),
            });
        }
        state.objects.insert(key.to_string());
        state
            .completed
            .push((key.to_string(), upload_id.to_string(), parts.to_vec()));
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state
            .aborted
            .push((key.to_string(), upload_id.to_string()));
        if let Some(err) = state.abort_failure.clone() {
            return Err(err);
        }
        state.uploads.remove(upload_id);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.deleted.push(key.to_string());
        state.objects.remove(key);
        Ok(())
    }
}

// ============================================================================
// Transport
// ============================================================================

/// One PUT seen by [`MemoryTransport`]
#[derive(Debug, Clone)]
pub struct RecordedPut {
    pub url: String,
    pub part_number: u32,
    pub len: usize,
    pub content_type: Option<String>,
}

#[derive(Default)]
struct TransportState {
    puts: Vec<RecordedPut>,
    failures: HashMap<u32, u32>,
    always_fail: HashSet<u32>,
    too_small: HashSet<u32>,
}

/// Transport that accepts bodies in memory and hands out eTags
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<TransportState>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` PUTs of `part_number` with a retryable error
    pub fn fail_part(&self, part_number: u32, times: u32) {
        self.state.lock().failures.insert(part_number, times);
    }

    pub fn fail_part_always(&self, part_number: u32) {
        self.state.lock().always_fail.insert(part_number);
    }

    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.always_fail.clear();
    }

    pub fn reject_too_small(&self, part_number: u32) {
        self.state.lock().too_small.insert(part_number);
    }

    pub fn puts(&self) -> Vec<RecordedPut> {
        self.state.lock().puts.clone()
    }

    pub fn puts_for(&self, part_number: u32) -> usize {
        self.state
            .lock()
            .puts
            .iter()
            .filter(|p| p.part_number == part_number)
            .count()
    }
}

/// Part number encoded in a memory URL; single-shot URLs count as part 1
pub fn part_number_of(url: &str) -> u32 {
    url.split(['?', '&'])
        .find_map(|pair| pair.strip_prefix("partNumber="))
        .and_then(|n| n.parse().ok())
        .unwrap_or(1)
}

#[async_trait]
impl PartTransport for MemoryTransport {
    async fn put(
        &self,
        link: &PresignedLink,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<String, TransportError> {
        let part_number = part_number_of(&link.url);
        let mut state = self.state.lock();
        state.puts.push(RecordedPut {
            url: link.url.clone(),
            part_number,
            len: body.len(),
            content_type: content_type.map(str::to_string),
        });
        let attempt = state.puts_count(part_number);

        if state.always_fail.contains(&part_number) {
            return Err(TransportError::Retryable("connection reset".into()));
        }
        if let Some(remaining) = state.failures.get_mut(&part_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Retryable("503 Slow Down".into()));
            }
        }
        if state.too_small.contains(&part_number) {
            return Err(TransportError::PartTooSmall(
                "Your proposed upload is smaller than the minimum allowed size".into(),
            ));
        }

        Ok(format!("\"etag-{}-{}\"", part_number, attempt))
    }
}

impl TransportState {
    fn puts_count(&self, part_number: u32) -> usize {
        self.puts
            .iter()
            .filter(|p| p.part_number == part_number)
            .count()
    }
}

// ============================================================================
// Processing trigger
// ============================================================================

/// Trigger that remembers every hand-off
#[derive(Default)]
pub struct RecordingTrigger {
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingTrigger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ProcessingTrigger for RecordingTrigger {
    async fn enqueue(&self, source_key: &str, derived_key: &str) -> MediaResult<()> {
        self.calls
            .lock()
            .push((source_key.to_string(), derived_key.to_string()));
        Ok(())
    }
}
