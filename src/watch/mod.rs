//! Completion watcher
//!
//! A watch polls for the derived object of an upload and yields one
//! [`WatchOutcome`] per probe. The sequence is lazy: nothing happens until
//! the consumer polls it, and dropping it stops all polling because no
//! background task exists.
//!
//! Schedule: the first probe runs immediately, later probes every
//! `poll_interval`. When the next probe would fall at or past the deadline
//! the watch sleeps until the deadline and ends with `Timeout` instead.

use crate::config::WatchConfig;
use crate::error::{MediaError, MediaResult};
use crate::metrics;
use crate::presign::{LinkIssuer, PresignedLink};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Parameters of one watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    pub source_key: String,
    pub derived_key: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl WatchRequest {
    /// Request using the configured interval and timeout
    pub fn new(
        source_key: impl Into<String>,
        derived_key: impl Into<String>,
        config: &WatchConfig,
    ) -> Self {
        Self {
            source_key: source_key.into(),
            derived_key: derived_key.into(),
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of one watch tick
#[derive(Debug)]
pub enum WatchOutcome {
    /// Derived object not there yet
    Pending { attempt: u32 },
    /// Derived object exists; the sequence ends
    Ready(PresignedLink),
    /// Deadline reached without observing the object; the sequence ends
    Timeout { elapsed: Duration },
    /// Probe failed for a reason other than not-found; the sequence ends
    Error(MediaError),
}

impl WatchOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WatchOutcome::Pending { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            WatchOutcome::Pending { .. } => "pending",
            WatchOutcome::Ready(_) => "ready",
            WatchOutcome::Timeout { .. } => "timeout",
            WatchOutcome::Error(_) => "error",
        }
    }
}

/// Handle that stops a watch from outside its consumer
#[derive(Debug, Clone)]
pub struct WatchCanceller {
    tx: Arc<watch::Sender<bool>>,
}

impl WatchCanceller {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A running watch, consumed as a [`Stream`] of outcomes
pub struct Watch {
    request: WatchRequest,
    canceller: WatchCanceller,
    inner: BoxStream<'static, WatchOutcome>,
    _guard: Option<Box<dyn Send>>,
}

impl Watch {
    pub fn request(&self) -> &WatchRequest {
        &self.request
    }

    pub fn canceller(&self) -> WatchCanceller {
        self.canceller.clone()
    }

    /// Stop polling; the sequence ends without a further outcome
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// Keep `guard` alive for as long as the watch exists
    pub(crate) fn attach(&mut self, guard: impl Send + 'static) {
        self._guard = Some(Box::new(guard));
    }
}

impl Stream for Watch {
    type Item = WatchOutcome;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("request", &self.request)
            .field("cancelled", &self.canceller.is_cancelled())
            .finish()
    }
}

struct Ticker {
    issuer: LinkIssuer,
    derived_key: String,
    poll_interval: Duration,
    get_ttl: Duration,
    started: Instant,
    deadline: Instant,
    next_probe: Instant,
    attempt: u32,
    finished: bool,
    cancel: watch::Receiver<bool>,
}

impl Ticker {
    async fn tick(&mut self) -> Option<WatchOutcome> {
        if self.finished {
            return None;
        }

        let timed_out = self.next_probe >= self.deadline;
        let wake = self.next_probe.min(self.deadline);

        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => return self.cancelled(),
            _ = tokio::time::sleep_until(wake) => {}
        }

        if timed_out {
            return Some(self.finish(WatchOutcome::Timeout {
                elapsed: Instant::now() - self.started,
            }));
        }

        self.attempt += 1;
        let probe = self.issuer.probe_get_link(&self.derived_key, self.get_ttl);
        let result = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => return self.cancelled(),
            result = probe => result,
        };

        let outcome = match result {
            Ok(link) => self.finish(WatchOutcome::Ready(link)),
            Err(MediaError::NotFound(_)) => {
                self.next_probe = Instant::now() + self.poll_interval;
                WatchOutcome::Pending {
                    attempt: self.attempt,
                }
            }
            Err(e) => self.finish(WatchOutcome::Error(e)),
        };

        tracing::debug!(
            s3.key = %self.derived_key,
            attempt = self.attempt,
            outcome = outcome.label(),
            "Watch tick"
        );
        Some(outcome)
    }

    fn finish(&mut self, outcome: WatchOutcome) -> WatchOutcome {
        self.finished = true;
        metrics::record_watch_outcome(outcome.label());
        outcome
    }

    fn cancelled(&mut self) -> Option<WatchOutcome> {
        self.finished = true;
        metrics::record_watch_outcome("cancelled");
        tracing::debug!(s3.key = %self.derived_key, "Watch cancelled");
        None
    }
}

/// Resolves once the cancel flag is raised; never if the sender is gone
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Completion watcher
#[derive(Clone)]
pub struct CompletionWatcher {
    issuer: LinkIssuer,
}

impl CompletionWatcher {
    pub fn new(issuer: LinkIssuer) -> Self {
        Self { issuer }
    }

    /// Start a watch
    ///
    /// Each call creates an independent watch; concurrent watches on the
    /// same key do not share probes.
    pub fn watch(&self, request: WatchRequest) -> MediaResult<Watch> {
        if request.derived_key.trim().is_empty() {
            return Err(MediaError::InvalidArgument(
                "derived key must not be empty".into(),
            ));
        }
        if request.poll_interval.is_zero() {
            return Err(MediaError::InvalidArgument(
                "poll interval must be greater than zero".into(),
            ));
        }
        if request.timeout.is_zero() {
            return Err(MediaError::InvalidArgument(
                "timeout must be greater than zero".into(),
            ));
        }

        let (tx, rx) = watch::channel(false);
        let started = Instant::now();
        let ticker = Ticker {
            issuer: self.issuer.clone(),
            derived_key: request.derived_key.clone(),
            poll_interval: request.poll_interval,
            get_ttl: self.issuer.ttls().get,
            started,
            deadline: started + request.timeout,
            next_probe: started,
            attempt: 0,
            finished: false,
            cancel: rx,
        };

        tracing::info!(
            source_key = %request.source_key,
            derived_key = %request.derived_key,
            poll_interval_ms = request.poll_interval.as_millis() as u64,
            timeout_ms = request.timeout.as_millis() as u64,
            "Watch started"
        );

        let inner = stream::unfold(ticker, |mut ticker| async move {
            let outcome = ticker.tick().await?;
            Some((outcome, ticker))
        })
        .boxed();

        Ok(Watch {
            request,
            canceller: WatchCanceller { tx: Arc::new(tx) },
            inner,
            _guard: None,
        })
    }

    /// A single probe, without scheduling
    ///
    /// `Ok(None)` while the object is absent.
    pub async fn probe_once(&self, derived_key: &str) -> MediaResult<Option<PresignedLink>> {
        match self
            .issuer
            .probe_get_link(derived_key, self.issuer.ttls().get)
            .await
        {
            Ok(link) => Ok(Some(link)),
            Err(MediaError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presign::LinkTtls;
    use crate::retry::RetryPolicy;
    use crate::s3::MockObjectStore;

    fn watcher(store: MockObjectStore) -> CompletionWatcher {
        CompletionWatcher::new(LinkIssuer::new(
            Arc::new(store),
            LinkTtls::default(),
            RetryPolicy::none(),
        ))
    }

    fn request(interval_ms: u64, timeout_ms: u64) -> WatchRequest {
        WatchRequest {
            source_key: "queue/abc.mp4".into(),
            derived_key: "processed/abc.mp4".into(),
            poll_interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn test_rejects_zero_interval() {
        let result = watcher(MockObjectStore::new()).watch(request(0, 1000));
        assert!(matches!(result, Err(MediaError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_ends_watch() {
        let mut store = MockObjectStore::new();
        store.expect_head_object().times(1).returning(|_| {
            Err(crate::s3::StorageError::Rejected {
                code: "AccessDenied".into(),
                message: "denied".into(),
            })
        });

        let mut watch = watcher(store).watch(request(1000, 5000)).unwrap();
        assert!(matches!(watch.next().await, Some(WatchOutcome::Error(_))));
        assert!(watch.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_probe() {
        let mut store = MockObjectStore::new();
        store.expect_head_object().times(0);

        let mut watch = watcher(store).watch(request(1000, 5000)).unwrap();
        watch.cancel();
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_probe_once_absent() {
        let mut store = MockObjectStore::new();
        store.expect_head_object().returning(|_| Ok(false));

        let result = watcher(store).probe_once("processed/abc.mp4").await.unwrap();
        assert!(result.is_none());
    }
}
