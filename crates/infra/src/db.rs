use chrono::Utc;
use parley_domain::error::DomainError;
use parley_domain::model::{Application, Chat, Message};
use parley_domain::ports::BoxFuture;
use parley_domain::ports::repository::Repository;
use sqlx::Row;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};

pub async fn connect_pool(database_url: &str) -> Result<MySqlPool, DomainError> {
    MySqlPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|err| DomainError::Unavailable(err.to_string()))
}

/// Canonical relational store over the `applications`/`chats`/`messages`
/// tables. The schema itself is owned by the out-of-band admin service.
#[derive(Clone)]
pub struct MySqlRepository {
    pool: MySqlPool,
}

impl MySqlRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn map_sqlx_error(err: sqlx::Error) -> DomainError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return DomainError::Conflict;
        }
    }
    DomainError::Unavailable(err.to_string())
}

fn application_from_row(row: &MySqlRow) -> Result<Application, sqlx::Error> {
    Ok(Application {
        id: row.try_get("id")?,
        token: row.try_get("token")?,
        name: row.try_get("name")?,
        chats_count: row.try_get("chats_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn chat_from_row(row: &MySqlRow) -> Result<Chat, sqlx::Error> {
    Ok(Chat {
        id: row.try_get("id")?,
        application_id: row.try_get("application_id")?,
        number: row.try_get("number")?,
        messages_count: row.try_get("messages_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &MySqlRow) -> Result<Message, sqlx::Error> {
    Ok(Message {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        number: row.try_get("number")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Repository for MySqlRepository {
    fn find_application_by_token(
        &self,
        token: &str,
    ) -> BoxFuture<'_, Result<Option<Application>, DomainError>> {
        let token = token.to_string();
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, token, name, chats_count, created_at, updated_at \
                 FROM applications WHERE token = ?",
            )
            .bind(&token)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            row.as_ref()
                .map(application_from_row)
                .transpose()
                .map_err(map_sqlx_error)
        })
    }

    fn find_chat(
        &self,
        application_id: i64,
        number: i64,
    ) -> BoxFuture<'_, Result<Option<Chat>, DomainError>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, application_id, number, messages_count, created_at, updated_at \
                 FROM chats WHERE application_id = ? AND number = ?",
            )
            .bind(application_id)
            .bind(number)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            row.as_ref()
                .map(chat_from_row)
                .transpose()
                .map_err(map_sqlx_error)
        })
    }

    fn insert_chat(
        &self,
        application_id: i64,
        number: i64,
    ) -> BoxFuture<'_, Result<Chat, DomainError>> {
        Box::pin(async move {
            let now = Utc::now();
            let result = sqlx::query(
                "INSERT INTO chats (application_id, number, messages_count, created_at, updated_at) \
                 VALUES (?, ?, 0, ?, ?)",
            )
            .bind(application_id)
            .bind(number)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            Ok(Chat {
                id: result.last_insert_id() as i64,
                application_id,
                number,
                messages_count: 0,
                created_at: now,
                updated_at: now,
            })
        })
    }

    fn find_message(
        &self,
        chat_id: i64,
        number: i64,
    ) -> BoxFuture<'_, Result<Option<Message>, DomainError>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, chat_id, number, content, created_at, updated_at \
                 FROM messages WHERE chat_id = ? AND number = ?",
            )
            .bind(chat_id)
            .bind(number)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            row.as_ref()
                .map(message_from_row)
                .transpose()
                .map_err(map_sqlx_error)
        })
    }

    fn insert_message(
        &self,
        chat_id: i64,
        number: i64,
        content: &str,
    ) -> BoxFuture<'_, Result<Message, DomainError>> {
        let content = content.to_string();
        Box::pin(async move {
            let now = Utc::now();
            let result = sqlx::query(
                "INSERT INTO messages (chat_id, number, content, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(chat_id)
            .bind(number)
            .bind(&content)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            Ok(Message {
                id: result.last_insert_id() as i64,
                chat_id,
                number,
                content,
                created_at: now,
                updated_at: now,
            })
        })
    }

    fn add_application_chats(
        &self,
        application_id: i64,
        delta: i64,
    ) -> BoxFuture<'_, Result<(), DomainError>> {
        Box::pin(async move {
            sqlx::query("UPDATE applications SET chats_count = chats_count + ? WHERE id = ?")
                .bind(delta)
                .bind(application_id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            Ok(())
        })
    }

    fn add_chat_messages(
        &self,
        chat_id: i64,
        delta: i64,
    ) -> BoxFuture<'_, Result<(), DomainError>> {
        Box::pin(async move {
            sqlx::query("UPDATE chats SET messages_count = messages_count + ? WHERE id = ?")
                .bind(delta)
                .bind(chat_id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            Ok(())
        })
    }
}
