use std::time::Duration;

use parley_domain::ports::BoxFuture;
use parley_domain::ports::counters::{CounterError, CounterStore};
use redis::aio::ConnectionManager;

const SCAN_BATCH: usize = 100;

// GETDEL exists, but a script stays atomic across server versions.
const FETCH_DELETE_SCRIPT: &str = r#"
local value = redis.call('GET', KEYS[1])
if value then
    redis.call('DEL', KEYS[1])
    return value
end
return nil
"#;

// Release only while we still hold the lock; an expired-and-reacquired
// lock belongs to someone else.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Clone)]
pub struct RedisCounterStore {
    manager: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str) -> Result<Self, CounterError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| CounterError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| CounterError::Unavailable(err.to_string()))?;
        Ok(Self { manager })
    }

    fn ttl_ms(ttl: Duration) -> u64 {
        let ms = ttl.as_millis() as u64;
        if ms == 0 { 1 } else { ms }
    }
}

impl CounterStore for RedisCounterStore {
    fn incr(&self, key: &str) -> BoxFuture<'_, Result<i64, CounterError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            redis::cmd("INCR")
                .arg(&key)
                .query_async::<_, i64>(&mut conn)
                .await
                .map_err(|err| CounterError::Operation(err.to_string()))
        })
    }

    fn incr_by(&self, key: &str, delta: i64) -> BoxFuture<'_, Result<i64, CounterError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            redis::cmd("INCRBY")
                .arg(&key)
                .arg(delta)
                .query_async::<_, i64>(&mut conn)
                .await
                .map_err(|err| CounterError::Operation(err.to_string()))
        })
    }

    fn scan(&self, pattern: &str) -> BoxFuture<'_, Result<Vec<String>, CounterError>> {
        let pattern = pattern.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut cursor = 0u64;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| CounterError::Operation(err.to_string()))?;
                keys.extend(batch);
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
            Ok(keys)
        })
    }

    fn fetch_delete(&self, key: &str) -> BoxFuture<'_, Result<Option<i64>, CounterError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let value: Option<String> = redis::cmd("EVAL")
                .arg(FETCH_DELETE_SCRIPT)
                .arg(1)
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|err| CounterError::Operation(err.to_string()))?;
            match value {
                Some(raw) => raw
                    .parse()
                    .map(Some)
                    .map_err(|err| CounterError::Operation(format!("non-numeric delta: {err}"))),
                None => Ok(None),
            }
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
            let mut conn = self.manager.clone();
            let result: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(Self::ttl_ms(ttl))
                .query_async(&mut conn)
                .await
                .map_err(|err| CounterError::Operation(err.to_string()))?;
            Ok(result.is_some())
        })
    }

    fn release_lock(&self, key: &str, token: &str) -> BoxFuture<'_, Result<(), CounterError>> {
        let key = key.to_string();
        let token = token.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = redis::cmd("EVAL")
                .arg(RELEASE_LOCK_SCRIPT)
                .arg(1)
                .arg(&key)
                .arg(&token)
                .query_async(&mut conn)
                .await
                .map_err(|err| CounterError::Operation(err.to_string()))?;
            Ok(())
        })
    }
}
