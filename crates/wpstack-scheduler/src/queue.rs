//! Trigger queue: serializes overlapping source changes.
//!
//! A bounded channel; the receiving half is drained by a single
//! [`Worker`](crate::Worker), so at most one run is in flight.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use wpstack_core::pipeline::Trigger;
use wpstack_core::{Error, Result};

/// Default number of triggers that may wait behind the running one.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Sending half of the trigger queue.
#[derive(Debug, Clone)]
pub struct TriggerQueue {
    tx: mpsc::Sender<Trigger>,
}

/// Receiving half of the trigger queue.
#[derive(Debug)]
pub struct TriggerReceiver {
    rx: mpsc::Receiver<Trigger>,
}

impl TriggerQueue {
    pub fn new(capacity: usize) -> (Self, TriggerReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, TriggerReceiver { rx })
    }

    /// Enqueue a trigger, waiting for room when the queue is full.
    pub async fn enqueue(&self, trigger: Trigger) -> Result<()> {
        debug!(revision = ?trigger.revision, "Enqueueing trigger");
        self.tx
            .send(trigger)
            .await
            .map_err(|_| Error::Internal("trigger queue closed".to_string()))
    }

    /// Enqueue without waiting. A full queue is reported as a conflict.
    pub fn try_enqueue(&self, trigger: Trigger) -> Result<()> {
        self.tx.try_send(trigger).map_err(|e| match e {
            TrySendError::Full(t) => Error::Conflict(format!(
                "trigger queue full, dropping revision {:?}",
                t.revision
            )),
            TrySendError::Closed(_) => Error::Internal("trigger queue closed".to_string()),
        })
    }

    /// Triggers that can still be enqueued without waiting.
    pub fn remaining(&self) -> usize {
        self.tx.capacity()
    }
}

impl TriggerReceiver {
    /// Next trigger, or `None` once every sender is dropped and the queue
    /// is drained.
    pub async fn next(&mut self) -> Option<Trigger> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let (queue, mut rx) = TriggerQueue::new(4);
        queue.enqueue(Trigger::revision("aaa1111")).await.unwrap();
        queue.enqueue(Trigger::revision("bbb2222")).await.unwrap();
        drop(queue);

        assert_eq!(rx.next().await.unwrap().revision.as_deref(), Some("aaa1111"));
        assert_eq!(rx.next().await.unwrap().revision.as_deref(), Some("bbb2222"));
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_is_a_conflict() {
        let (queue, _rx) = TriggerQueue::new(1);
        queue.try_enqueue(Trigger::revision("aaa1111")).unwrap();
        assert_eq!(queue.remaining(), 0);

        assert!(matches!(
            queue.try_enqueue(Trigger::revision("bbb2222")),
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_triggers() {
        let (queue, rx) = TriggerQueue::new(1);
        drop(rx);
        assert!(matches!(
            queue.enqueue(Trigger::default()).await,
            Err(Error::Internal(_))
        ));
    }
}
