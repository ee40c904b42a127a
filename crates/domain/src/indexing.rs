use std::time::Duration;

use serde_json::json;

use crate::model::IndexEnvelope;

pub const BATCH_SIZE: usize = 1000;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Accumulates index payloads between flushes. The caller owns the lock;
/// a flush drains the whole buffer and, if the bulk write fails, puts the
/// drained slice back in front of anything that arrived meanwhile.
#[derive(Debug)]
pub struct IndexBatch {
    entries: Vec<IndexEnvelope>,
    threshold: usize,
}

impl IndexBatch {
    pub fn new(threshold: usize) -> Self {
        Self {
            entries: Vec::with_capacity(threshold),
            threshold,
        }
    }

    /// Appends one payload; returns true once the buffer is due a flush.
    pub fn push(&mut self, envelope: IndexEnvelope) -> bool {
        self.entries.push(envelope);
        self.entries.len() >= self.threshold
    }

    pub fn drain(&mut self) -> Vec<IndexEnvelope> {
        std::mem::take(&mut self.entries)
    }

    /// Re-queues a failed batch ahead of entries accepted since the drain.
    pub fn restore_front(&mut self, mut drained: Vec<IndexEnvelope>) {
        std::mem::swap(&mut self.entries, &mut drained);
        self.entries.append(&mut drained);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for IndexBatch {
    fn default() -> Self {
        Self::new(BATCH_SIZE)
    }
}

/// Newline-delimited action/source pairs for the index's bulk endpoint.
pub fn bulk_body(entries: &[IndexEnvelope]) -> String {
    let mut body = String::new();
    for entry in entries {
        let action = json!({
            "index": {
                "_id": entry.document_id(),
                "routing": entry.routing(),
            }
        });
        let document = json!({
            "application_token": &entry.application_token,
            "application_name": &entry.application_name,
            "chat_number": entry.chat_number,
            "message_number": entry.message_number,
            "content": &entry.content,
            "created_at": entry.created_at,
        });
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&document.to_string());
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn envelope(message_number: i64) -> IndexEnvelope {
        IndexEnvelope {
            message_id: message_number,
            application_id: 1,
            application_token: "tok1".to_string(),
            application_name: "App One".to_string(),
            chat_id: 1,
            chat_number: 2,
            message_number,
            content: format!("message {message_number}"),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn push_reports_threshold() {
        let mut batch = IndexBatch::new(2);
        assert!(!batch.push(envelope(1)));
        assert!(batch.push(envelope(2)));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn drain_empties_the_buffer() {
        let mut batch = IndexBatch::new(10);
        batch.push(envelope(1));
        batch.push(envelope(2));
        let drained = batch.drain();
        assert_eq!(drained.len(), 2);
        assert!(batch.is_empty());
    }

    #[test]
    fn restore_front_keeps_failed_batch_ahead_of_new_entries() {
        let mut batch = IndexBatch::new(10);
        batch.push(envelope(1));
        batch.push(envelope(2));
        let drained = batch.drain();

        // Arrived while the failed flush was in flight.
        batch.push(envelope(3));
        batch.restore_front(drained);

        let order: Vec<i64> = batch.drain().iter().map(|e| e.message_number).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn bulk_body_alternates_action_and_source_lines() {
        let body = bulk_body(&[envelope(1), envelope(2)]);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);

        let action: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_id"], "tok1:2:1");
        assert_eq!(action["index"]["routing"], "tok1:2");

        let source: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(source["application_token"], "tok1");
        assert_eq!(source["message_number"], 1);
        assert_eq!(source["content"], "message 1");
        assert!(body.ends_with('\n'));
    }
}
