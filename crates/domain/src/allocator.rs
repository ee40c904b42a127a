use std::sync::Arc;

use crate::ports::counters::{CounterError, CounterStore};

pub fn chat_counter_key(app_token: &str) -> String {
    format!("app:{app_token}:chats_count")
}

pub fn message_counter_key(app_token: &str, chat_number: i64) -> String {
    format!("app:{app_token}:chat:{chat_number}:messages_count")
}

pub fn app_chats_delta_key(application_id: i64) -> String {
    format!("delta:app:{application_id}:chats")
}

pub fn chat_messages_delta_key(chat_id: i64) -> String {
    format!("delta:chat:{chat_id}:messages")
}

/// Monotonic per-scope sequence numbers, backed by the key-value store's
/// atomic increment. A number handed out here is never reissued, even
/// when the downstream persistence of that number fails.
#[derive(Clone)]
pub struct SequenceAllocator {
    counters: Arc<dyn CounterStore>,
}

impl SequenceAllocator {
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }

    pub async fn next_chat_number(&self, app_token: &str) -> Result<i64, CounterError> {
        self.counters.incr(&chat_counter_key(app_token)).await
    }

    pub async fn next_message_number(
        &self,
        app_token: &str,
        chat_number: i64,
    ) -> Result<i64, CounterError> {
        self.counters
            .incr(&message_counter_key(app_token, chat_number))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_keys_are_scoped() {
        assert_eq!(chat_counter_key("tok1"), "app:tok1:chats_count");
        assert_eq!(
            message_counter_key("tok1", 4),
            "app:tok1:chat:4:messages_count"
        );
        assert_eq!(app_chats_delta_key(12), "delta:app:12:chats");
        assert_eq!(chat_messages_delta_key(34), "delta:chat:34:messages");
    }
}
