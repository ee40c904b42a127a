use std::time::Duration;

use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter operation failed: {0}")]
    Operation(String),
}

/// Atomic counter and lock primitives of the key-value store.
///
/// `incr` is the allocator primitive: strictly monotonic and unique per
/// key under concurrent callers. `fetch_delete` must be atomic (a
/// server-side script) so the reconciler never double-drains a delta.
pub trait CounterStore: Send + Sync {
    fn incr(&self, key: &str) -> BoxFuture<'_, Result<i64, CounterError>>;

    fn incr_by(&self, key: &str, delta: i64) -> BoxFuture<'_, Result<i64, CounterError>>;

    /// All keys currently matching `pattern`, collected via cursor scans.
    fn scan(&self, pattern: &str) -> BoxFuture<'_, Result<Vec<String>, CounterError>>;

    /// Atomically read and delete `key`; `None` when the key is absent.
    fn fetch_delete(&self, key: &str) -> BoxFuture<'_, Result<Option<i64>, CounterError>>;

    /// Set-if-absent with TTL. Returns whether the lock was acquired.
    fn acquire_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, CounterError>>;

    /// Delete `key` only while it still holds `token`.
    fn release_lock(&self, key: &str, token: &str) -> BoxFuture<'_, Result<(), CounterError>>;
}
