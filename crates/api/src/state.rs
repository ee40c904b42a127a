use std::sync::Arc;

use parley_domain::allocator::SequenceAllocator;
use parley_domain::ports::broker::Publisher;
use parley_domain::ports::counters::CounterStore;
use parley_domain::ports::index::MessageIndex;
use parley_infra::config::AppConfig;
use parley_infra::counters::RedisCounterStore;
use parley_infra::index::EsMessageIndex;
use parley_infra::queue::AmqpBroker;

/// One long-lived handle apiece to the counter store, the broker and
/// the search index, created at startup and shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub allocator: SequenceAllocator,
    pub publisher: Arc<dyn Publisher>,
    pub index: Arc<dyn MessageIndex>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let counters = RedisCounterStore::connect(&config.redis_url).await?;
        let broker = AmqpBroker::connect(&config.amqp_url).await?;
        let index = EsMessageIndex::new(config.elasticsearch_url.clone());
        Ok(Self::with_ports(
            config,
            Arc::new(counters),
            Arc::new(broker),
            Arc::new(index),
        ))
    }

    pub fn with_ports(
        config: AppConfig,
        counters: Arc<dyn CounterStore>,
        publisher: Arc<dyn Publisher>,
        index: Arc<dyn MessageIndex>,
    ) -> Self {
        Self {
            config,
            allocator: SequenceAllocator::new(counters),
            publisher,
            index,
        }
    }
}
