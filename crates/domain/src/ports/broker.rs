use serde_json::Value;
use thiserror::Error;

use super::BoxFuture;
use crate::model::QueueName;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker serialization error: {0}")]
    Serialization(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Publishes JSON payloads to a named durable queue with persistent
/// delivery. No per-publish confirmation; durability comes from the
/// durable-queue + persistent-message pairing.
pub trait Publisher: Send + Sync {
    fn publish(&self, queue: QueueName, payload: Value) -> BoxFuture<'_, Result<(), BrokerError>>;
}
