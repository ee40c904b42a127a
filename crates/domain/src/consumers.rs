use std::sync::Arc;

use tracing::{info, warn};

use crate::allocator::{app_chats_delta_key, chat_messages_delta_key};
use crate::error::DomainError;
use crate::model::{
    Application, Chat, ChatEnvelope, IndexEnvelope, Message, MessageEnvelope, QueueName,
};
use crate::ports::broker::Publisher;
use crate::ports::counters::CounterStore;
use crate::ports::repository::Repository;

/// What the consumer loop should do with a delivery after processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Effect applied (or already applied); acknowledge.
    Completed,
    /// Unrecoverable payload; acknowledge to drop it.
    Discard,
    /// Transient fault; negatively acknowledge with requeue.
    Retry,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Completed => "completed",
            Disposition::Discard => "discard",
            Disposition::Retry => "retry",
        }
    }
}

/// Persists chat-created events. Idempotent on (application_id, number):
/// redeliveries and insert races both resolve to an acknowledged no-op.
#[derive(Clone)]
pub struct ChatIngestor {
    repository: Arc<dyn Repository>,
    counters: Arc<dyn CounterStore>,
}

impl ChatIngestor {
    pub fn new(repository: Arc<dyn Repository>, counters: Arc<dyn CounterStore>) -> Self {
        Self {
            repository,
            counters,
        }
    }

    pub async fn process(&self, body: &[u8]) -> Disposition {
        let envelope: ChatEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping malformed chat payload");
                return Disposition::Discard;
            }
        };

        if envelope.app_token.is_empty() || envelope.chat_number <= 0 {
            warn!(
                app_token = %envelope.app_token,
                chat_number = envelope.chat_number,
                "dropping chat payload with missing fields"
            );
            return Disposition::Discard;
        }

        let application = match self
            .repository
            .find_application_by_token(&envelope.app_token)
            .await
        {
            Ok(Some(application)) => application,
            Ok(None) => {
                warn!(app_token = %envelope.app_token, "unknown application token; dropping");
                return Disposition::Discard;
            }
            Err(err) => {
                warn!(error = %err, "application lookup failed");
                return Disposition::Retry;
            }
        };

        match self
            .repository
            .find_chat(application.id, envelope.chat_number)
            .await
        {
            Ok(Some(chat)) => {
                info!(chat_id = chat.id, number = chat.number, "chat already persisted");
                return Disposition::Completed;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "chat lookup failed");
                return Disposition::Retry;
            }
        }

        let chat = match self
            .repository
            .insert_chat(application.id, envelope.chat_number)
            .await
        {
            Ok(chat) => chat,
            Err(DomainError::Conflict) => {
                info!(
                    application_id = application.id,
                    number = envelope.chat_number,
                    "lost chat insert race; already persisted"
                );
                return Disposition::Completed;
            }
            Err(err) => {
                warn!(error = %err, "chat insert failed");
                return Disposition::Retry;
            }
        };

        info!(
            chat_id = chat.id,
            number = chat.number,
            app_token = %envelope.app_token,
            "chat created"
        );

        // Best effort: the reconciler catches up from whatever lands here.
        if let Err(err) = self
            .counters
            .incr(&app_chats_delta_key(application.id))
            .await
        {
            warn!(error = %err, application_id = application.id, "failed to increment chat delta");
        }

        Disposition::Completed
    }
}

/// Persists message-created events and hands the result to the indexing
/// queue. A missing parent chat requeues the delivery: the chat consumer
/// may simply not have caught up yet.
#[derive(Clone)]
pub struct MessageIngestor {
    repository: Arc<dyn Repository>,
    counters: Arc<dyn CounterStore>,
    publisher: Arc<dyn Publisher>,
}

impl MessageIngestor {
    pub fn new(
        repository: Arc<dyn Repository>,
        counters: Arc<dyn CounterStore>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            repository,
            counters,
            publisher,
        }
    }

    pub async fn process(&self, body: &[u8]) -> Disposition {
        let envelope: MessageEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping malformed message payload");
                return Disposition::Discard;
            }
        };

        if envelope.app_token.is_empty()
            || envelope.chat_number <= 0
            || envelope.message_number <= 0
            || envelope.content.is_empty()
        {
            warn!(
                app_token = %envelope.app_token,
                chat_number = envelope.chat_number,
                message_number = envelope.message_number,
                "dropping message payload with missing fields"
            );
            return Disposition::Discard;
        }

        let application = match self.repository.find_application_by_token(&envelope.app_token).await
        {
            Ok(Some(application)) => application,
            Ok(None) => {
                warn!(app_token = %envelope.app_token, "unknown application token; dropping");
                return Disposition::Discard;
            }
            Err(err) => {
                warn!(error = %err, "application lookup failed");
                return Disposition::Retry;
            }
        };

        let chat = match self
            .repository
            .find_chat(application.id, envelope.chat_number)
            .await
        {
            Ok(Some(chat)) => chat,
            Ok(None) => {
                // The chat-create event may still be in flight on the other
                // queue; requeue and let prefetch pace the retries.
                warn!(
                    app_token = %envelope.app_token,
                    chat_number = envelope.chat_number,
                    "parent chat not persisted yet; requeueing"
                );
                return Disposition::Retry;
            }
            Err(err) => {
                warn!(error = %err, "chat lookup failed");
                return Disposition::Retry;
            }
        };

        match self
            .repository
            .find_message(chat.id, envelope.message_number)
            .await
        {
            Ok(Some(message)) => {
                info!(message_id = message.id, "message already persisted");
                return Disposition::Completed;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "message lookup failed");
                return Disposition::Retry;
            }
        }

        let message = match self
            .repository
            .insert_message(chat.id, envelope.message_number, &envelope.content)
            .await
        {
            Ok(message) => message,
            Err(DomainError::Conflict) => {
                info!(
                    chat_id = chat.id,
                    number = envelope.message_number,
                    "lost message insert race; already persisted"
                );
                return Disposition::Completed;
            }
            Err(err) => {
                warn!(error = %err, "message insert failed");
                return Disposition::Retry;
            }
        };

        info!(
            message_id = message.id,
            number = message.number,
            chat_id = chat.id,
            "message created"
        );

        if let Err(err) = self
            .counters
            .incr(&chat_messages_delta_key(chat.id))
            .await
        {
            warn!(error = %err, chat_id = chat.id, "failed to increment message delta");
        }

        // The row is durable; a lost handoff only delays indexing until
        // the next full reindex.
        self.enqueue_for_indexing(&message, &chat, &application).await;

        Disposition::Completed
    }

    async fn enqueue_for_indexing(
        &self,
        message: &Message,
        chat: &Chat,
        application: &Application,
    ) {
        let envelope = IndexEnvelope::new(message, chat, application);
        let payload = match serde_json::to_value(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, message_id = message.id, "failed to serialize index payload");
                return;
            }
        };
        if let Err(err) = self.publisher.publish(QueueName::Indexing, payload).await {
            warn!(error = %err, message_id = message.id, "failed to queue message for indexing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCounterStore, MemoryPublisher, MemoryRepository};

    fn chat_ingestor() -> (ChatIngestor, MemoryRepository, MemoryCounterStore) {
        let repository = MemoryRepository::new();
        let counters = MemoryCounterStore::new();
        let ingestor = ChatIngestor::new(
            Arc::new(repository.clone()),
            Arc::new(counters.clone()),
        );
        (ingestor, repository, counters)
    }

    fn message_ingestor() -> (
        MessageIngestor,
        MemoryRepository,
        MemoryCounterStore,
        MemoryPublisher,
    ) {
        let repository = MemoryRepository::new();
        let counters = MemoryCounterStore::new();
        let publisher = MemoryPublisher::new();
        let ingestor = MessageIngestor::new(
            Arc::new(repository.clone()),
            Arc::new(counters.clone()),
            Arc::new(publisher.clone()),
        );
        (ingestor, repository, counters, publisher)
    }

    fn chat_payload(token: &str, number: i64) -> Vec<u8> {
        serde_json::to_vec(&ChatEnvelope {
            app_token: token.to_string(),
            chat_number: number,
        })
        .unwrap()
    }

    fn message_payload(token: &str, chat: i64, number: i64, content: &str) -> Vec<u8> {
        serde_json::to_vec(&MessageEnvelope {
            app_token: token.to_string(),
            chat_number: chat,
            message_number: number,
            content: content.to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn malformed_chat_payload_is_dropped() {
        let (ingestor, repository, _) = chat_ingestor();
        assert_eq!(ingestor.process(b"not json").await, Disposition::Discard);
        assert!(repository.chats().is_empty());
    }

    #[tokio::test]
    async fn chat_for_unknown_application_is_dropped() {
        let (ingestor, repository, _) = chat_ingestor();
        let disposition = ingestor.process(&chat_payload("ghost", 1)).await;
        assert_eq!(disposition, Disposition::Discard);
        assert!(repository.chats().is_empty());
    }

    #[tokio::test]
    async fn chat_redelivery_is_idempotent() {
        let (ingestor, repository, counters) = chat_ingestor();
        let application = repository.seed_application("tok1", "App One");

        assert_eq!(
            ingestor.process(&chat_payload("tok1", 1)).await,
            Disposition::Completed
        );
        assert_eq!(
            ingestor.process(&chat_payload("tok1", 1)).await,
            Disposition::Completed
        );

        assert_eq!(repository.chats().len(), 1);
        // Only the first delivery counts toward the delta.
        assert_eq!(
            counters.value(&app_chats_delta_key(application.id)),
            Some(1)
        );
    }

    #[tokio::test]
    async fn chat_insert_failure_requeues() {
        let (ingestor, repository, _) = chat_ingestor();
        repository.seed_application("tok1", "App One");
        repository.fail_writes(true);
        assert_eq!(
            ingestor.process(&chat_payload("tok1", 1)).await,
            Disposition::Retry
        );
    }

    #[tokio::test]
    async fn chat_survives_delta_counter_outage() {
        let (ingestor, repository, counters) = chat_ingestor();
        repository.seed_application("tok1", "App One");
        counters.fail_operations(true);
        assert_eq!(
            ingestor.process(&chat_payload("tok1", 1)).await,
            Disposition::Completed
        );
        assert_eq!(repository.chats().len(), 1);
    }

    #[tokio::test]
    async fn message_without_parent_chat_requeues_until_chat_lands() {
        let (ingestor, repository, _, _) = message_ingestor();
        repository.seed_application("tok1", "App One");

        let payload = message_payload("tok1", 7, 1, "hello");
        assert_eq!(ingestor.process(&payload).await, Disposition::Retry);

        let application = repository.application("tok1").unwrap();
        let chat_ingestor = ChatIngestor::new(
            Arc::new(repository.clone()),
            Arc::new(MemoryCounterStore::new()),
        );
        chat_ingestor.process(&chat_payload("tok1", 7)).await;
        assert_eq!(ingestor.process(&payload).await, Disposition::Completed);

        let messages = repository.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].number, 1);
        let chats = repository.chats();
        assert_eq!(chats[0].application_id, application.id);
    }

    #[tokio::test]
    async fn message_redelivery_is_idempotent() {
        let (ingestor, repository, _, publisher) = message_ingestor();
        repository.seed_application("tok1", "App One");
        let chat_ingestor = ChatIngestor::new(
            Arc::new(repository.clone()),
            Arc::new(MemoryCounterStore::new()),
        );
        chat_ingestor.process(&chat_payload("tok1", 1)).await;

        let payload = message_payload("tok1", 1, 1, "hello");
        assert_eq!(ingestor.process(&payload).await, Disposition::Completed);
        assert_eq!(ingestor.process(&payload).await, Disposition::Completed);

        assert_eq!(repository.messages().len(), 1);
        // Only the first delivery reaches the indexing queue.
        assert_eq!(publisher.published(QueueName::Indexing).len(), 1);
    }

    #[tokio::test]
    async fn message_emits_index_envelope() {
        let (ingestor, repository, counters, publisher) = message_ingestor();
        repository.seed_application("tok1", "App One");
        let chat_ingestor = ChatIngestor::new(
            Arc::new(repository.clone()),
            Arc::new(MemoryCounterStore::new()),
        );
        chat_ingestor.process(&chat_payload("tok1", 1)).await;

        ingestor
            .process(&message_payload("tok1", 1, 1, "hello world"))
            .await;

        let published = publisher.published(QueueName::Indexing);
        assert_eq!(published.len(), 1);
        let envelope: IndexEnvelope = serde_json::from_value(published[0].clone()).unwrap();
        assert_eq!(envelope.application_token, "tok1");
        assert_eq!(envelope.chat_number, 1);
        assert_eq!(envelope.message_number, 1);
        assert_eq!(envelope.content, "hello world");

        let chat = repository.chats().remove(0);
        assert_eq!(
            counters.value(&chat_messages_delta_key(chat.id)),
            Some(1)
        );
    }

    #[tokio::test]
    async fn message_survives_indexing_handoff_failure() {
        let (ingestor, repository, _, publisher) = message_ingestor();
        repository.seed_application("tok1", "App One");
        let chat_ingestor = ChatIngestor::new(
            Arc::new(repository.clone()),
            Arc::new(MemoryCounterStore::new()),
        );
        chat_ingestor.process(&chat_payload("tok1", 1)).await;

        publisher.fail_publishes(true);
        assert_eq!(
            ingestor
                .process(&message_payload("tok1", 1, 1, "hello"))
                .await,
            Disposition::Completed
        );
        assert_eq!(repository.messages().len(), 1);
    }

    #[tokio::test]
    async fn message_with_empty_content_is_dropped() {
        let (ingestor, _, _, _) = message_ingestor();
        assert_eq!(
            ingestor.process(&message_payload("tok1", 1, 1, "")).await,
            Disposition::Discard
        );
    }
}
