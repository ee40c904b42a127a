use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tenant row. Created out of band; this system only ever reads it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub id: i64,
    pub token: String,
    pub name: String,
    pub chats_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    pub id: i64,
    pub application_id: i64,
    pub number: i64,
    pub messages_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub number: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The three durable queues shared by the api and worker processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueName {
    Chats,
    Messages,
    Indexing,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Chats, QueueName::Messages, QueueName::Indexing];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Chats => "chats_queue",
            QueueName::Messages => "messages_queue",
            QueueName::Indexing => "indexing_queue",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatEnvelope {
    pub app_token: String,
    pub chat_number: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageEnvelope {
    pub app_token: String,
    pub chat_number: i64,
    pub message_number: i64,
    pub content: String,
}

/// Everything the indexing consumer needs to build one index document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IndexEnvelope {
    pub message_id: i64,
    pub application_id: i64,
    pub application_token: String,
    pub application_name: String,
    pub chat_id: i64,
    pub chat_number: i64,
    pub message_number: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl IndexEnvelope {
    pub fn new(message: &Message, chat: &Chat, application: &Application) -> Self {
        Self {
            message_id: message.id,
            application_id: application.id,
            application_token: application.token.clone(),
            application_name: application.name.clone(),
            chat_id: chat.id,
            chat_number: chat.number,
            message_number: message.number,
            content: message.content.clone(),
            created_at: message.created_at,
        }
    }

    /// Deterministic document id; redelivery overwrites instead of duplicating.
    pub fn document_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.application_token, self.chat_number, self.message_number
        )
    }

    /// Shard routing key; one chat's messages all land on the same shard.
    pub fn routing(&self) -> String {
        routing_key(&self.application_token, self.chat_number)
    }
}

pub fn routing_key(app_token: &str, chat_number: i64) -> String {
    format!("{app_token}:{chat_number}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_match_broker_declarations() {
        assert_eq!(QueueName::Chats.as_str(), "chats_queue");
        assert_eq!(QueueName::Messages.as_str(), "messages_queue");
        assert_eq!(QueueName::Indexing.as_str(), "indexing_queue");
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = MessageEnvelope {
            app_token: "tok1".to_string(),
            chat_number: 3,
            message_number: 7,
            content: "hello".to_string(),
        };
        let raw = serde_json::to_vec(&envelope).expect("serialize");
        let parsed: MessageEnvelope = serde_json::from_slice(&raw).expect("deserialize");
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn document_id_and_routing_are_composite() {
        let envelope = IndexEnvelope {
            message_id: 1,
            application_id: 2,
            application_token: "tok1".to_string(),
            application_name: "App".to_string(),
            chat_id: 3,
            chat_number: 4,
            message_number: 5,
            content: "hi".to_string(),
            created_at: Utc::now(),
        };
        assert_eq!(envelope.document_id(), "tok1:4:5");
        assert_eq!(envelope.routing(), "tok1:4");
    }
}
