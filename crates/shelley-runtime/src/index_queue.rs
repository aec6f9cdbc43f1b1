//! Backpressured Index Queue (§4.8): a bounded, single-worker queue of
//! `ConversationId`s to re-index after a turn ends. Enqueue never blocks —
//! a full queue just logs and drops, the way the teacher's telemetry
//! queues favor availability of the hot path over completeness of the
//! side channel.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shelley_core::ConversationId;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub const DEFAULT_CAPACITY: usize = 64;

/// External indexing sink (e.g. full-text search). Out of scope to
/// implement here (§1) — the queue only owns the scheduling discipline.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(&self, conversation_id: ConversationId);
}

/// The shipped `Indexer`: search/memory indexing itself is out of scope
/// (§1 Non-goals) — this just gives the queue somewhere to hand work to by
/// default.
pub struct NoopIndexer;

#[async_trait]
impl Indexer for NoopIndexer {
    async fn index(&self, _conversation_id: ConversationId) {}
}

pub struct IndexQueue {
    tx: mpsc::Sender<ConversationId>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IndexQueue {
    pub fn new(indexer: Arc<dyn Indexer>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let worker = spawn_worker(indexer, rx, None);
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Test-support: the worker waits on `gate` before draining, so a test
    /// can fill the bounded channel deterministically before any item is
    /// consumed.
    #[cfg(test)]
    fn new_gated(indexer: Arc<dyn Indexer>, capacity: usize, gate: Arc<Notify>) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let worker = spawn_worker(indexer, rx, Some(gate));
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Non-blocking; drops and logs on a full or closed queue (§4.8
    /// "non-blocking enqueue").
    pub fn enqueue(&self, conversation_id: ConversationId) {
        match self.tx.try_send(conversation_id) {
            Ok(()) => {}
            Err(TrySendError::Full(id)) => {
                tracing::warn!(conversation_id = %id, "index queue full, dropping");
            }
            Err(TrySendError::Closed(id)) => {
                tracing::warn!(conversation_id = %id, "index queue closed, dropping");
            }
        }
    }

    /// Stop accepting new work and drain what's already queued before
    /// returning (§4.8 "drains remaining on shutdown").
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Some(handle) = self.worker.into_inner().unwrap() {
            let _ = handle.await;
        }
    }
}

fn spawn_worker(indexer: Arc<dyn Indexer>, mut rx: mpsc::Receiver<ConversationId>, gate: Option<Arc<Notify>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(gate) = gate {
            gate.notified().await;
        }
        while let Some(conversation_id) = rx.recv().await {
            indexer.index(conversation_id).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingIndexer {
        seen: StdMutex<Vec<ConversationId>>,
    }

    impl RecordingIndexer {
        fn new() -> Arc<Self> {
            Arc::new(Self { seen: StdMutex::new(Vec::new()) })
        }
        fn seen(&self) -> Vec<ConversationId> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Indexer for RecordingIndexer {
        async fn index(&self, conversation_id: ConversationId) {
            self.seen.lock().unwrap().push(conversation_id);
        }
    }

    #[tokio::test]
    async fn drains_queued_items_in_order() {
        let indexer = RecordingIndexer::new();
        let queue = IndexQueue::new(indexer.clone(), DEFAULT_CAPACITY);
        let a = ConversationId::new();
        let b = ConversationId::new();
        queue.enqueue(a);
        queue.enqueue(b);
        queue.shutdown().await;
        assert_eq!(indexer.seen(), vec![a, b]);
    }

    #[tokio::test]
    async fn full_queue_drops_rather_than_blocks() {
        let indexer = RecordingIndexer::new();
        let gate = Arc::new(Notify::new());
        let queue = IndexQueue::new_gated(indexer.clone(), 1, gate.clone());

        let a = ConversationId::new();
        let b = ConversationId::new();
        queue.enqueue(a);
        // Buffer (capacity 1) is full and the worker hasn't started draining yet.
        queue.enqueue(b);

        gate.notify_one();
        queue.shutdown().await;

        assert_eq!(indexer.seen(), vec![a]);
    }
}
