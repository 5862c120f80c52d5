//! Processing trigger
//!
//! Hand-off point to the external processing pipeline. The crate does not
//! own the pipeline; it only reports that a source object is ready.

use crate::error::MediaResult;
use async_trait::async_trait;

/// Notifies the processing pipeline that a source object has landed
#[async_trait]
pub trait ProcessingTrigger: Send + Sync {
    async fn enqueue(&self, source_key: &str, derived_key: &str) -> MediaResult<()>;
}

/// Trigger for pipelines that watch the queue prefix themselves
///
/// Landing under the queue prefix already starts processing, so this only
/// records the hand-off.
#[derive(Debug, Default, Clone)]
pub struct QueuePrefixTrigger;

#[async_trait]
impl ProcessingTrigger for QueuePrefixTrigger {
    async fn enqueue(&self, source_key: &str, derived_key: &str) -> MediaResult<()> {
        tracing::info!(
            source_key = source_key,
            derived_key = derived_key,
            "Source object queued for processing"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_prefix_trigger_accepts() {
        let trigger = QueuePrefixTrigger;
        assert!(trigger
            .enqueue("queue/a.mp4", "processed/a.mp4")
            .await
            .is_ok());
    }
}
