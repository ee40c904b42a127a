use std::sync::Arc;

use parley_domain::consumers::Disposition;
use parley_domain::indexing::{IndexBatch, bulk_body};
use parley_domain::model::IndexEnvelope;
use parley_domain::ports::index::{IndexError, MessageIndex};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Batched indexing consumer. Deliveries are acknowledged on enqueue
/// into the buffer: the relational store is the source of truth and the
/// index is rebuildable, so a crash between ack and flush costs at most
/// one batch of documents until a reindex.
pub struct Indexer {
    batch: Arc<Mutex<IndexBatch>>,
    index: Arc<dyn MessageIndex>,
}

impl Indexer {
    pub fn new(index: Arc<dyn MessageIndex>) -> Self {
        Self {
            batch: Arc::new(Mutex::new(IndexBatch::default())),
            index,
        }
    }

    pub async fn process(&self, body: &[u8]) -> Disposition {
        let envelope: IndexEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping malformed index payload");
                return Disposition::Discard;
            }
        };

        let due = self.batch.lock().await.push(envelope);
        if due {
            if let Err(err) = self.flush().await {
                // The drained batch is back in the buffer; the ticker
                // retries it.
                warn!(error = %err, "threshold flush failed");
            }
        }

        Disposition::Completed
    }

    /// Drain the buffer and bulk-write it. On failure the drained slice
    /// is prepended back so the next flush retries those documents.
    pub async fn flush(&self) -> Result<usize, IndexError> {
        let drained = {
            let mut batch = self.batch.lock().await;
            if batch.is_empty() {
                return Ok(0);
            }
            batch.drain()
        };

        let count = drained.len();
        info!(count, "flushing messages to the index");
        let body = bulk_body(&drained);
        if let Err(err) = self.index.bulk_write(body).await {
            self.batch.lock().await.restore_front(drained);
            return Err(err);
        }

        info!(count, "indexed messages");
        Ok(count)
    }

    pub async fn pending(&self) -> usize {
        self.batch.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_domain::memory::MemoryIndex;

    fn payload(message_number: i64) -> Vec<u8> {
        serde_json::to_vec(&IndexEnvelope {
            message_id: message_number,
            application_id: 1,
            application_token: "tok1".to_string(),
            application_name: "App One".to_string(),
            chat_id: 1,
            chat_number: 1,
            message_number,
            content: format!("message {message_number}"),
            created_at: Utc::now(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let index = MemoryIndex::new();
        let indexer = Indexer::new(Arc::new(index.clone()));
        assert_eq!(indexer.process(b"nope").await, Disposition::Discard);
        assert_eq!(indexer.pending().await, 0);
    }

    #[tokio::test]
    async fn deliveries_accumulate_until_flushed() {
        let index = MemoryIndex::new();
        let indexer = Indexer::new(Arc::new(index.clone()));

        assert_eq!(indexer.process(&payload(1)).await, Disposition::Completed);
        assert_eq!(indexer.process(&payload(2)).await, Disposition::Completed);
        assert_eq!(indexer.pending().await, 2);
        assert!(index.bulk_bodies().is_empty());

        assert_eq!(indexer.flush().await.unwrap(), 2);
        assert_eq!(indexer.pending().await, 0);

        let bodies = index.bulk_bodies();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].contains(r#""_id":"tok1:1:1""#));
        assert!(bodies[0].contains(r#""routing":"tok1:1""#));
    }

    #[tokio::test]
    async fn empty_flush_is_a_no_op() {
        let index = MemoryIndex::new();
        let indexer = Indexer::new(Arc::new(index.clone()));
        assert_eq!(indexer.flush().await.unwrap(), 0);
        assert!(index.bulk_bodies().is_empty());
    }

    #[tokio::test]
    async fn failed_flush_keeps_documents_for_the_next_attempt() {
        let index = MemoryIndex::new();
        let indexer = Indexer::new(Arc::new(index.clone()));

        indexer.process(&payload(1)).await;
        index.fail_bulk_writes(true);
        assert!(indexer.flush().await.is_err());
        assert_eq!(indexer.pending().await, 1);

        index.fail_bulk_writes(false);
        assert_eq!(indexer.flush().await.unwrap(), 1);
        assert_eq!(indexer.pending().await, 0);
    }
}
