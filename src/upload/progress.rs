//! Upload progress reporting
//!
//! Progress counts only bytes whose part has been acknowledged by storage.
//! Ticks are published on a `tokio::sync::watch` channel; the value is
//! monotonically non-decreasing and reaches 100 exactly when the last part
//! is acknowledged.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Snapshot of upload progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub percent: u8,
}

impl TransferProgress {
    fn compute(bytes_sent: u64, total_bytes: u64, done: bool) -> Self {
        let percent = if done {
            100
        } else if total_bytes == 0 {
            0
        } else {
            // Floor, and never report 100 before the last acknowledgment
            ((bytes_sent as u128 * 100 / total_bytes as u128) as u8).min(99)
        };
        Self {
            bytes_sent,
            total_bytes,
            percent,
        }
    }
}

#[derive(Debug)]
struct Ledger {
    bytes_sent: u64,
    parts_acked: u32,
}

/// Accumulates acknowledged bytes for one upload
#[derive(Debug)]
pub struct ProgressTracker {
    total_bytes: u64,
    total_parts: u32,
    ledger: Mutex<Ledger>,
    tx: watch::Sender<TransferProgress>,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, total_parts: u32) -> Self {
        let (tx, _rx) = watch::channel(TransferProgress::default());
        Self::with_sender(total_bytes, total_parts, tx)
    }

    /// Tracker publishing on a caller-owned channel
    pub fn with_sender(
        total_bytes: u64,
        total_parts: u32,
        tx: watch::Sender<TransferProgress>,
    ) -> Self {
        tx.send_replace(TransferProgress::compute(0, total_bytes, false));
        Self {
            total_bytes,
            total_parts,
            ledger: Mutex::new(Ledger {
                bytes_sent: 0,
                parts_acked: 0,
            }),
            tx,
        }
    }

    /// Receiver for progress ticks
    pub fn subscribe(&self) -> watch::Receiver<TransferProgress> {
        self.tx.subscribe()
    }

    /// Current progress
    pub fn snapshot(&self) -> TransferProgress {
        *self.tx.borrow()
    }

    /// Record one acknowledged part of `bytes` bytes and publish a tick
    pub fn part_acknowledged(&self, bytes: u64) -> TransferProgress {
        let progress = {
            let mut ledger = self.ledger.lock();
            ledger.bytes_sent = (ledger.bytes_sent + bytes).min(self.total_bytes);
            ledger.parts_acked = (ledger.parts_acked + 1).min(self.total_parts);
            TransferProgress::compute(
                ledger.bytes_sent,
                self.total_bytes,
                ledger.parts_acked == self.total_parts,
            )
        };
        // Publish under the channel's own lock so ticks never go backwards
        self.tx.send_if_modified(|current| {
            if progress.bytes_sent > current.bytes_sent || progress.percent > current.percent {
                *current = progress;
                true
            } else {
                false
            }
        });
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_floors_and_holds_below_100() {
        let tracker = ProgressTracker::new(1000, 2);
        assert_eq!(tracker.part_acknowledged(999).percent, 99);
        assert_eq!(tracker.part_acknowledged(1).percent, 100);
    }

    #[test]
    fn test_empty_upload_completes_on_ack() {
        let tracker = ProgressTracker::new(0, 1);
        assert_eq!(tracker.snapshot().percent, 0);
        assert_eq!(tracker.part_acknowledged(0).percent, 100);
    }

    #[test]
    fn test_ticks_are_monotonic() {
        let tracker = ProgressTracker::new(12, 3);
        let mut last = 0;
        for bytes in [5, 5, 2] {
            let tick = tracker.part_acknowledged(bytes);
            assert!(tick.percent >= last);
            last = tick.percent;
        }
        assert_eq!(last, 100);
        assert_eq!(tracker.snapshot().bytes_sent, 12);
    }

    #[tokio::test]
    async fn test_subscriber_sees_latest_tick() {
        let tracker = ProgressTracker::new(10, 2);
        let mut rx = tracker.subscribe();
        tracker.part_acknowledged(5);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().percent, 50);
    }
}
