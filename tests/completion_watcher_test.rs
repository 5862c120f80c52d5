//! Completion Watcher Tests
//!
//! Runs on a paused clock so poll schedules are exact.
//!
//! ## Test Coverage
//!
//! - Pending ticks followed by Ready, with no probes afterwards
//! - Timeout at the deadline
//! - Cancellation by id and from another task
//! - Probe errors end the watch

mod common;

use common::{service, MemoryStore, RecordingTrigger};
use futures::StreamExt;
use mizuchi_media::error::{ErrorKind, MediaError};
use mizuchi_media::presign::LinkOperation;
use mizuchi_media::s3::StorageError;
use mizuchi_media::watch::WatchOutcome;
use std::time::Duration;

const DERIVED: &str = "processed/abc.mp4";

#[tokio::test(start_paused = true)]
async fn test_ready_after_two_pending_ticks() {
    let store = MemoryStore::new();
    store.appear_after(DERIVED, 3);
    let service = service(store.clone(), RecordingTrigger::new());

    let (_id, mut watch) = service
        .start_watch(service.watch_request("queue/abc.mp4", DERIVED))
        .unwrap();

    let started = tokio::time::Instant::now();
    assert!(matches!(
        watch.next().await,
        Some(WatchOutcome::Pending { attempt: 1 })
    ));
    assert!(matches!(
        watch.next().await,
        Some(WatchOutcome::Pending { attempt: 2 })
    ));

    match watch.next().await {
        Some(WatchOutcome::Ready(link)) => {
            assert_eq!(link.operation, LinkOperation::GetObject);
            assert!(link.url.contains(DERIVED));
            assert!(!link.is_expired());
        }
        other => panic!("expected Ready, got {:?}", other),
    }
    assert_eq!(started.elapsed(), Duration::from_millis(2000));

    assert!(watch.next().await.is_none());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(store.head_probes(DERIVED), 3);
}

#[tokio::test(start_paused = true)]
async fn test_times_out_at_deadline() {
    let store = MemoryStore::new();
    let service = service(store.clone(), RecordingTrigger::new());

    // 1s interval, 5s timeout from the test configuration
    let (_id, watch) = service
        .start_watch(service.watch_request("queue/abc.mp4", DERIVED))
        .unwrap();
    let outcomes: Vec<WatchOutcome> = watch.collect().await;

    assert_eq!(outcomes.len(), 6);
    assert!(outcomes[..5]
        .iter()
        .all(|o| matches!(o, WatchOutcome::Pending { .. })));
    match &outcomes[5] {
        WatchOutcome::Timeout { elapsed } => assert!(*elapsed >= Duration::from_millis(5000)),
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert_eq!(store.head_probes(DERIVED), 5);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_shorter_than_interval_probes_once() {
    let store = MemoryStore::new();
    let service = service(store.clone(), RecordingTrigger::new());

    let request = service
        .watch_request("", DERIVED)
        .with_poll_interval(Duration::from_secs(10))
        .with_timeout(Duration::from_secs(3));
    let (_id, watch) = service.start_watch(request).unwrap();
    let outcomes: Vec<WatchOutcome> = watch.collect().await;

    assert_eq!(outcomes.len(), 2);
    assert!(matches!(
        outcomes[1],
        WatchOutcome::Timeout { elapsed } if elapsed == Duration::from_secs(3)
    ));
    assert_eq!(store.head_probes(DERIVED), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_by_id_ends_sequence() {
    let store = MemoryStore::new();
    let service = service(store.clone(), RecordingTrigger::new());

    let (id, mut watch) = service
        .start_watch(service.watch_request("", DERIVED))
        .unwrap();
    assert_eq!(service.active_watches(), 1);
    assert!(matches!(
        watch.next().await,
        Some(WatchOutcome::Pending { .. })
    ));

    assert!(service.cancel_watch(&id));
    assert!(!service.cancel_watch(&id));
    assert!(watch.next().await.is_none());
    assert_eq!(store.head_probes(DERIVED), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_from_another_task_interrupts_wait() {
    let store = MemoryStore::new();
    let service = service(store.clone(), RecordingTrigger::new());

    let (_id, watch) = service
        .start_watch(service.watch_request("", DERIVED))
        .unwrap();
    let canceller = watch.canceller();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        canceller.cancel();
    });

    let outcomes: Vec<WatchOutcome> = watch.collect().await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, WatchOutcome::Pending { .. })));
    assert_eq!(store.head_probes(DERIVED), 3);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_watch_unregisters_it() {
    let service = service(MemoryStore::new(), RecordingTrigger::new());

    let (_first, watch_a) = service
        .start_watch(service.watch_request("", DERIVED))
        .unwrap();
    let (_second, watch_b) = service
        .start_watch(service.watch_request("", DERIVED))
        .unwrap();
    assert_eq!(service.active_watches(), 2);

    drop(watch_a);
    assert_eq!(service.active_watches(), 1);
    drop(watch_b);
    assert_eq!(service.active_watches(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_watches_probe_independently() {
    let store = MemoryStore::new();
    store.appear_after(DERIVED, 2);
    let service = service(store.clone(), RecordingTrigger::new());

    let (_a, mut first) = service
        .start_watch(service.watch_request("", DERIVED))
        .unwrap();
    let (_b, mut second) = service
        .start_watch(service.watch_request("", DERIVED))
        .unwrap();

    assert!(matches!(
        first.next().await,
        Some(WatchOutcome::Pending { .. })
    ));
    // The object exists from the second probe on, whichever watch makes it
    assert!(matches!(second.next().await, Some(WatchOutcome::Ready(_))));
    assert!(matches!(first.next().await, Some(WatchOutcome::Ready(_))));
}

#[tokio::test(start_paused = true)]
async fn test_probe_error_ends_watch() {
    let store = MemoryStore::new();
    store.fail_next_head(StorageError::Rejected {
        code: "AccessDenied".into(),
        message: "Access Denied".into(),
    });
    let service = service(store.clone(), RecordingTrigger::new());

    let (_id, mut watch) = service
        .start_watch(service.watch_request("", DERIVED))
        .unwrap();

    match watch.next().await {
        Some(WatchOutcome::Error(e)) => assert_eq!(e.kind(), ErrorKind::StorageRejected),
        other => panic!("expected Error, got {:?}", other),
    }
    assert!(watch.next().await.is_none());
    assert_eq!(store.head_probes(DERIVED), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_derived_key_is_rejected() {
    let service = service(MemoryStore::new(), RecordingTrigger::new());

    let err = service
        .start_watch(service.watch_request("queue/abc.mp4", "  "))
        .unwrap_err();
    assert!(matches!(err, MediaError::InvalidArgument(_)));
    assert_eq!(service.active_watches(), 0);
}
