//! In-memory implementations of the ports, used by unit tests and the
//! handler tests in the service crates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;

use crate::error::DomainError;
use crate::model::{Application, Chat, Message, QueueName};
use crate::ports::BoxFuture;
use crate::ports::broker::{BrokerError, Publisher};
use crate::ports::counters::{CounterError, CounterStore};
use crate::ports::index::{IndexError, MessageIndex};
use crate::ports::repository::Repository;
use crate::search::{SearchRequest, SearchResults};

#[derive(Clone, Default)]
pub struct MemoryCounterStore {
    inner: Arc<Mutex<CounterState>>,
    fail: Arc<AtomicBool>,
}

#[derive(Default)]
struct CounterState {
    values: HashMap<String, i64>,
    locks: HashMap<String, (String, Instant)>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `Unavailable`.
    pub fn fail_operations(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn value(&self, key: &str) -> Option<i64> {
        self.inner.lock().expect("counter state").values.get(key).copied()
    }

    fn check(&self) -> Result<(), CounterError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CounterError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

fn key_matches(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            key.len() >= prefix.len() + suffix.len()
                && key.starts_with(prefix)
                && key.ends_with(suffix)
        }
        None => pattern == key,
    }
}

impl CounterStore for MemoryCounterStore {
    fn incr(&self, key: &str) -> BoxFuture<'_, Result<i64, CounterError>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check()?;
            let mut state = self.inner.lock().expect("counter state");
            let value = state.values.entry(key).or_insert(0);
            *value += 1;
            Ok(*value)
        })
    }

    fn incr_by(&self, key: &str, delta: i64) -> BoxFuture<'_, Result<i64, CounterError>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check()?;
            let mut state = self.inner.lock().expect("counter state");
            let value = state.values.entry(key).or_insert(0);
            *value += delta;
            Ok(*value)
        })
    }

    fn scan(&self, pattern: &str) -> BoxFuture<'_, Result<Vec<String>, CounterError>> {
        let pattern = pattern.to_string();
        Box::pin(async move {
            self.check()?;
            let state = self.inner.lock().expect("counter state");
            Ok(state
                .values
                .keys()
                .filter(|key| key_matches(&pattern, key))
                .cloned()
                .collect())
        })
    }

    fn fetch_delete(&self, key: &str) -> BoxFuture<'_, Result<Option<i64>, CounterError>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check()?;
            let mut state = self.inner.lock().expect("counter state");
            Ok(state.values.remove(&key))
        })
    }

    fn acquire_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, CounterError>> {
        let key = key.to_string();
        let token = token.to_string();
        Box::pin(async move {
            self.check()?;
            let mut state = self.inner.lock().expect("counter state");
            if let Some((_, expires_at)) = state.locks.get(&key) {
                if *expires_at > Instant::now() {
                    return Ok(false);
                }
            }
            state.locks.insert(key, (token, Instant::now() + ttl));
            Ok(true)
        })
    }

    fn release_lock(&self, key: &str, token: &str) -> BoxFuture<'_, Result<(), CounterError>> {
        let key = key.to_string();
        let token = token.to_string();
        Box::pin(async move {
            self.check()?;
            let mut state = self.inner.lock().expect("counter state");
            if state
                .locks
                .get(&key)
                .is_some_and(|(holder, _)| *holder == token)
            {
                state.locks.remove(&key);
            }
            Ok(())
        })
    }
}

#[derive(Clone, Default)]
pub struct MemoryPublisher {
    inner: Arc<Mutex<Vec<(QueueName, Value)>>>,
    fail: Arc<AtomicBool>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self, queue: QueueName) -> Vec<Value> {
        self.inner
            .lock()
            .expect("published messages")
            .iter()
            .filter(|(name, _)| *name == queue)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl Publisher for MemoryPublisher {
    fn publish(&self, queue: QueueName, payload: Value) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BrokerError::Publish("injected failure".to_string()));
            }
            self.inner
                .lock()
                .expect("published messages")
                .push((queue, payload));
            Ok(())
        })
    }
}

#[derive(Default)]
struct RepositoryState {
    applications: Vec<Application>,
    chats: Vec<Chat>,
    messages: Vec<Message>,
    next_chat_id: i64,
    next_message_id: i64,
}

#[derive(Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<Mutex<RepositoryState>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_application(&self, token: &str, name: &str) -> Application {
        let mut state = self.inner.lock().expect("repository state");
        let now = Utc::now();
        let application = Application {
            id: state.applications.len() as i64 + 1,
            token: token.to_string(),
            name: name.to_string(),
            chats_count: 0,
            created_at: now,
            updated_at: now,
        };
        state.applications.push(application.clone());
        application
    }

    /// Make every subsequent write fail with `Unavailable`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn chats(&self) -> Vec<Chat> {
        self.inner.lock().expect("repository state").chats.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().expect("repository state").messages.clone()
    }

    pub fn application(&self, token: &str) -> Option<Application> {
        self.inner
            .lock()
            .expect("repository state")
            .applications
            .iter()
            .find(|application| application.token == token)
            .cloned()
    }

    fn check_writable(&self) -> Result<(), DomainError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DomainError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl Repository for MemoryRepository {
    fn find_application_by_token(
        &self,
        token: &str,
    ) -> BoxFuture<'_, Result<Option<Application>, DomainError>> {
        let token = token.to_string();
        Box::pin(async move { Ok(self.application(&token)) })
    }

    fn find_chat(
        &self,
        application_id: i64,
        number: i64,
    ) -> BoxFuture<'_, Result<Option<Chat>, DomainError>> {
        Box::pin(async move {
            let state = self.inner.lock().expect("repository state");
            Ok(state
                .chats
                .iter()
                .find(|chat| chat.application_id == application_id && chat.number == number)
                .cloned())
        })
    }

    fn insert_chat(
        &self,
        application_id: i64,
        number: i64,
    ) -> BoxFuture<'_, Result<Chat, DomainError>> {
        Box::pin(async move {
            self.check_writable()?;
            let mut state = self.inner.lock().expect("repository state");
            if state
                .chats
                .iter()
                .any(|chat| chat.application_id == application_id && chat.number == number)
            {
                return Err(DomainError::Conflict);
            }
            state.next_chat_id += 1;
            let now = Utc::now();
            let chat = Chat {
                id: state.next_chat_id,
                application_id,
                number,
                messages_count: 0,
                created_at: now,
                updated_at: now,
            };
            state.chats.push(chat.clone());
            Ok(chat)
        })
    }

    fn find_message(
        &self,
        chat_id: i64,
        number: i64,
    ) -> BoxFuture<'_, Result<Option<Message>, DomainError>> {
        Box::pin(async move {
            let state = self.inner.lock().expect("repository state");
            Ok(state
                .messages
                .iter()
                .find(|message| message.chat_id == chat_id && message.number == number)
                .cloned())
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
            self.check_writable()?;
            let mut state = self.inner.lock().expect("repository state");
            if state
                .messages
                .iter()
                .any(|message| message.chat_id == chat_id && message.number == number)
            {
                return Err(DomainError::Conflict);
            }
            state.next_message_id += 1;
            let now = Utc::now();
            let message = Message {
                id: state.next_message_id,
                chat_id,
                number,
                content,
                created_at: now,
                updated_at: now,
            };
            state.messages.push(message.clone());
            Ok(message)
        })
    }

    fn add_application_chats(
        &self,
        application_id: i64,
        delta: i64,
    ) -> BoxFuture<'_, Result<(), DomainError>> {
        Box::pin(async move {
            self.check_writable()?;
            let mut state = self.inner.lock().expect("repository state");
            if let Some(application) = state
                .applications
                .iter_mut()
                .find(|application| application.id == application_id)
            {
                application.chats_count += delta;
            }
            Ok(())
        })
    }

    fn add_chat_messages(
        &self,
        chat_id: i64,
        delta: i64,
    ) -> BoxFuture<'_, Result<(), DomainError>> {
        Box::pin(async move {
            self.check_writable()?;
            let mut state = self.inner.lock().expect("repository state");
            if let Some(chat) = state.chats.iter_mut().find(|chat| chat.id == chat_id) {
                chat.messages_count += delta;
            }
            Ok(())
        })
    }
}

#[derive(Clone, Default)]
pub struct MemoryIndex {
    bulks: Arc<Mutex<Vec<String>>>,
    results: Arc<Mutex<SearchResults>>,
    fail_bulk: Arc<AtomicBool>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_bulk_writes(&self, fail: bool) {
        self.fail_bulk.store(fail, Ordering::SeqCst);
    }

    pub fn set_results(&self, results: SearchResults) {
        *self.results.lock().expect("search results") = results;
    }

    pub fn bulk_bodies(&self) -> Vec<String> {
        self.bulks.lock().expect("bulk bodies").clone()
    }
}

impl MessageIndex for MemoryIndex {
    fn ensure_index(&self) -> BoxFuture<'_, Result<(), IndexError>> {
        Box::pin(async move { Ok(()) })
    }

    fn bulk_write(&self, body: String) -> BoxFuture<'_, Result<(), IndexError>> {
        Box::pin(async move {
            if self.fail_bulk.load(Ordering::SeqCst) {
                return Err(IndexError::Request("injected failure".to_string()));
            }
            self.bulks.lock().expect("bulk bodies").push(body);
            Ok(())
        })
    }

    fn search(
        &self,
        _request: &SearchRequest,
    ) -> BoxFuture<'_, Result<SearchResults, IndexError>> {
        Box::pin(async move { Ok(self.results.lock().expect("search results").clone()) })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), IndexError>> {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_is_monotonic_per_key() {
        let counters = MemoryCounterStore::new();
        assert_eq!(counters.incr("app:tok1:chats_count").await.unwrap(), 1);
        assert_eq!(counters.incr("app:tok1:chats_count").await.unwrap(), 2);
        assert_eq!(counters.incr("app:tok2:chats_count").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_allocation_has_no_gaps_or_duplicates() {
        let counters = Arc::new(MemoryCounterStore::new());
        let mut handles = Vec::new();
        for _ in 0..100 {
            let counters = counters.clone();
            handles.push(tokio::spawn(async move {
                counters.incr("app:tok1:chats_count").await.unwrap()
            }));
        }
        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=100).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let counters = MemoryCounterStore::new();
        let ttl = Duration::from_secs(15);
        assert!(counters.acquire_lock("lock:reconciliation", "a", ttl).await.unwrap());
        assert!(!counters.acquire_lock("lock:reconciliation", "b", ttl).await.unwrap());

        // A stale token must not release the current holder's lock.
        counters.release_lock("lock:reconciliation", "b").await.unwrap();
        assert!(!counters.acquire_lock("lock:reconciliation", "b", ttl).await.unwrap());

        counters.release_lock("lock:reconciliation", "a").await.unwrap();
        assert!(counters.acquire_lock("lock:reconciliation", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn scan_matches_glob_patterns() {
        let counters = MemoryCounterStore::new();
        counters.incr_by("delta:app:1:chats", 2).await.unwrap();
        counters.incr_by("delta:chat:9:messages", 1).await.unwrap();
        let keys = counters.scan("delta:app:*:chats").await.unwrap();
        assert_eq!(keys, vec!["delta:app:1:chats".to_string()]);
    }
}
