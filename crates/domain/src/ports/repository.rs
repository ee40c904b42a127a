use super::BoxFuture;
use crate::error::DomainError;
use crate::model::{Application, Chat, Message};

/// Canonical relational store. Inserts surface duplicate-key races as
/// `DomainError::Conflict`; transport faults as `DomainError::Unavailable`.
pub trait Repository: Send + Sync {
    fn find_application_by_token(
        &self,
        token: &str,
    ) -> BoxFuture<'_, Result<Option<Application>, DomainError>>;

    fn find_chat(
        &self,
        application_id: i64,
        number: i64,
    ) -> BoxFuture<'_, Result<Option<Chat>, DomainError>>;

    fn insert_chat(
        &self,
        application_id: i64,
        number: i64,
    ) -> BoxFuture<'_, Result<Chat, DomainError>>;

    fn find_message(
        &self,
        chat_id: i64,
        number: i64,
    ) -> BoxFuture<'_, Result<Option<Message>, DomainError>>;

    fn insert_message(
        &self,
        chat_id: i64,
        number: i64,
        content: &str,
    ) -> BoxFuture<'_, Result<Message, DomainError>>;

    fn add_application_chats(
        &self,
        application_id: i64,
        delta: i64,
    ) -> BoxFuture<'_, Result<(), DomainError>>;

    fn add_chat_messages(
        &self,
        chat_id: i64,
        delta: i64,
    ) -> BoxFuture<'_, Result<(), DomainError>>;
}
