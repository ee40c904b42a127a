use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DomainError;
use crate::ports::counters::{CounterError, CounterStore};
use crate::ports::repository::Repository;

pub const LOCK_KEY: &str = "lock:reconciliation";
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(15);

/// The delta key families folded back into relational aggregates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileTarget {
    ApplicationChats,
    ChatMessages,
}

impl ReconcileTarget {
    pub const ALL: [ReconcileTarget; 2] =
        [ReconcileTarget::ApplicationChats, ReconcileTarget::ChatMessages];

    pub fn pattern(&self) -> &'static str {
        match self {
            ReconcileTarget::ApplicationChats => "delta:app:*:chats",
            ReconcileTarget::ChatMessages => "delta:chat:*:messages",
        }
    }

    pub fn entity(&self) -> &'static str {
        match self {
            ReconcileTarget::ApplicationChats => "application",
            ReconcileTarget::ChatMessages => "chat",
        }
    }
}

/// Entity id from the third segment of a delta key
/// (`delta:app:123:chats` -> 123).
pub fn entity_id(key: &str) -> Result<i64, DomainError> {
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() != 4 {
        return Err(DomainError::Validation(format!("invalid delta key: {key}")));
    }
    parts[2]
        .parse()
        .map_err(|_| DomainError::Validation(format!("invalid delta key: {key}")))
}

/// Folds pending delta counters into the relational aggregate columns.
/// One instance at a time holds `lock:reconciliation`; a crashed holder
/// is recovered when the TTL lapses.
#[derive(Clone)]
pub struct CounterReconciler {
    counters: Arc<dyn CounterStore>,
    repository: Arc<dyn Repository>,
    lock_ttl: Duration,
}

impl CounterReconciler {
    pub fn new(counters: Arc<dyn CounterStore>, repository: Arc<dyn Repository>) -> Self {
        Self {
            counters,
            repository,
            lock_ttl: RECONCILE_INTERVAL,
        }
    }

    /// One reconcile pass. Returns false when another instance holds the
    /// lock and the pass was skipped.
    pub async fn reconcile(&self) -> Result<bool, CounterError> {
        let token = Uuid::now_v7().to_string();
        if !self
            .counters
            .acquire_lock(LOCK_KEY, &token, self.lock_ttl)
            .await?
        {
            debug!("another instance is reconciling; skipping tick");
            return Ok(false);
        }

        for target in ReconcileTarget::ALL {
            if let Err(err) = self.reconcile_target(target).await {
                warn!(error = %err, entity = target.entity(), "failed to reconcile counters");
            }
        }

        self.counters.release_lock(LOCK_KEY, &token).await?;
        Ok(true)
    }

    async fn reconcile_target(&self, target: ReconcileTarget) -> Result<(), CounterError> {
        let keys = self.counters.scan(target.pattern()).await?;
        if keys.is_empty() {
            return Ok(());
        }
        info!(
            count = keys.len(),
            entity = target.entity(),
            "reconciling delta counters"
        );
        for key in keys {
            if let Err(err) = self.reconcile_key(target, &key).await {
                warn!(error = %err, key = %key, "failed to reconcile delta key");
            }
        }
        Ok(())
    }

    async fn reconcile_key(&self, target: ReconcileTarget, key: &str) -> Result<(), DomainError> {
        let delta = match self
            .counters
            .fetch_delete(key)
            .await
            .map_err(|err| DomainError::Unavailable(err.to_string()))?
        {
            Some(delta) if delta != 0 => delta,
            _ => return Ok(()),
        };

        let id = entity_id(key)?;
        let applied = match target {
            ReconcileTarget::ApplicationChats => {
                self.repository.add_application_chats(id, delta).await
            }
            ReconcileTarget::ChatMessages => self.repository.add_chat_messages(id, delta).await,
        };

        if let Err(err) = applied {
            // Put the drained value back so a later tick retries it.
            if let Err(restore) = self.counters.incr_by(key, delta).await {
                warn!(error = %restore, key = %key, delta, "failed to restore drained delta");
            }
            return Err(err);
        }

        info!(entity = target.entity(), id, delta, "applied delta counter");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{app_chats_delta_key, chat_messages_delta_key};
    use crate::memory::{MemoryCounterStore, MemoryRepository};

    fn reconciler() -> (CounterReconciler, MemoryCounterStore, MemoryRepository) {
        let counters = MemoryCounterStore::new();
        let repository = MemoryRepository::new();
        let reconciler = CounterReconciler::new(
            Arc::new(counters.clone()),
            Arc::new(repository.clone()),
        );
        (reconciler, counters, repository)
    }

    #[test]
    fn entity_id_parses_third_segment() {
        assert_eq!(entity_id("delta:app:123:chats").unwrap(), 123);
        assert_eq!(entity_id("delta:chat:456:messages").unwrap(), 456);
        assert!(entity_id("delta:app:chats").is_err());
        assert!(entity_id("delta:app:abc:chats").is_err());
    }

    #[tokio::test]
    async fn drains_deltas_into_aggregates() {
        let (reconciler, counters, repository) = reconciler();
        let application = repository.seed_application("tok1", "App One");
        let chat = repository.insert_chat(application.id, 1).await.unwrap();

        counters
            .incr_by(&app_chats_delta_key(application.id), 5)
            .await
            .unwrap();
        counters
            .incr_by(&chat_messages_delta_key(chat.id), 3)
            .await
            .unwrap();

        assert!(reconciler.reconcile().await.unwrap());

        assert_eq!(repository.application("tok1").unwrap().chats_count, 5);
        assert_eq!(repository.chats()[0].messages_count, 3);
        // Drained keys are gone until new activity recreates them.
        assert_eq!(counters.value(&app_chats_delta_key(application.id)), None);
        assert_eq!(counters.value(&chat_messages_delta_key(chat.id)), None);
    }

    #[tokio::test]
    async fn failed_apply_restores_the_delta() {
        let (reconciler, counters, repository) = reconciler();
        let application = repository.seed_application("tok1", "App One");
        counters
            .incr_by(&app_chats_delta_key(application.id), 4)
            .await
            .unwrap();

        repository.fail_writes(true);
        assert!(reconciler.reconcile().await.unwrap());

        // Accounting preserved for the next tick.
        assert_eq!(
            counters.value(&app_chats_delta_key(application.id)),
            Some(4)
        );
        repository.fail_writes(false);
        assert!(reconciler.reconcile().await.unwrap());
        assert_eq!(repository.application("tok1").unwrap().chats_count, 4);
    }

    #[tokio::test]
    async fn tick_is_skipped_while_lock_is_held() {
        let (reconciler, counters, repository) = reconciler();
        let application = repository.seed_application("tok1", "App One");
        counters
            .incr_by(&app_chats_delta_key(application.id), 2)
            .await
            .unwrap();

        counters
            .acquire_lock(LOCK_KEY, "other-instance", Duration::from_secs(15))
            .await
            .unwrap();
        assert!(!reconciler.reconcile().await.unwrap());
        assert_eq!(
            counters.value(&app_chats_delta_key(application.id)),
            Some(2)
        );

        counters
            .release_lock(LOCK_KEY, "other-instance")
            .await
            .unwrap();
        assert!(reconciler.reconcile().await.unwrap());
        assert_eq!(repository.application("tok1").unwrap().chats_count, 2);
    }

    #[tokio::test]
    async fn zero_deltas_are_skipped() {
        let (reconciler, counters, repository) = reconciler();
        let application = repository.seed_application("tok1", "App One");
        counters
            .incr_by(&app_chats_delta_key(application.id), 0)
            .await
            .unwrap();

        assert!(reconciler.reconcile().await.unwrap());
        assert_eq!(repository.application("tok1").unwrap().chats_count, 0);
    }
}
