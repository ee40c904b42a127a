mod indexer;
mod observability;

use std::sync::Arc;

use parley_domain::consumers::{ChatIngestor, MessageIngestor};
use parley_domain::indexing::FLUSH_INTERVAL;
use parley_domain::model::QueueName;
use parley_domain::ports::broker::Publisher;
use parley_domain::ports::counters::CounterStore;
use parley_domain::ports::index::MessageIndex;
use parley_domain::ports::repository::Repository;
use parley_domain::reconcile::{CounterReconciler, RECONCILE_INTERVAL};
use parley_infra::config::AppConfig;
use parley_infra::counters::RedisCounterStore;
use parley_infra::db::{MySqlRepository, connect_pool};
use parley_infra::index::EsMessageIndex;
use parley_infra::logging::init_tracing;
use parley_infra::queue::AmqpBroker;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::indexer::Indexer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let _log_guard = init_tracing(&config)?;
    observability::init_metrics()?;

    info!("starting worker");

    // The relational store and the broker are hard requirements; exit if
    // either is unreachable at boot.
    let pool = connect_pool(&config.database_url()).await?;
    let repository: Arc<dyn Repository> = Arc::new(MySqlRepository::new(pool));
    let counters: Arc<dyn CounterStore> =
        Arc::new(RedisCounterStore::connect(&config.redis_url).await?);
    let broker = Arc::new(AmqpBroker::connect(&config.amqp_url).await?);

    // The index is softer: wait for it, then proceed either way. Bulk
    // writes requeue into the batch until it comes up.
    let search_index = EsMessageIndex::new(config.elasticsearch_url.clone());
    search_index.wait_until_available().await;
    if let Err(err) = search_index.ensure_index().await {
        warn!(error = %err, "failed to bootstrap index; bulk writes will retry");
    }
    let index: Arc<dyn MessageIndex> = Arc::new(search_index);

    let chat_ingestor = ChatIngestor::new(repository.clone(), counters.clone());
    let message_ingestor = MessageIngestor::new(
        repository.clone(),
        counters.clone(),
        broker.clone() as Arc<dyn Publisher>,
    );
    let indexer = Arc::new(Indexer::new(index));
    let reconciler = CounterReconciler::new(counters, repository);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let chat_task = tokio::spawn({
        let broker = broker.clone();
        async move {
            let result = broker
                .run_consumer(QueueName::Chats, move |body| {
                    let ingestor = chat_ingestor.clone();
                    async move {
                        let disposition = ingestor.process(&body).await;
                        observability::register_delivery(
                            QueueName::Chats.as_str(),
                            disposition.as_str(),
                        );
                        disposition
                    }
                })
                .await;
            if let Err(err) = result {
                error!(error = %err, "chat consumer failed");
            }
        }
    });

    let message_task = tokio::spawn({
        let broker = broker.clone();
        async move {
            let result = broker
                .run_consumer(QueueName::Messages, move |body| {
                    let ingestor = message_ingestor.clone();
                    async move {
                        let disposition = ingestor.process(&body).await;
                        observability::register_delivery(
                            QueueName::Messages.as_str(),
                            disposition.as_str(),
                        );
                        disposition
                    }
                })
                .await;
            if let Err(err) = result {
                error!(error = %err, "message consumer failed");
            }
        }
    });

    let indexing_task = tokio::spawn({
        let broker = broker.clone();
        let indexer = indexer.clone();
        async move {
            let result = broker
                .run_consumer(QueueName::Indexing, move |body| {
                    let indexer = indexer.clone();
                    async move {
                        let disposition = indexer.process(&body).await;
                        observability::register_delivery(
                            QueueName::Indexing.as_str(),
                            disposition.as_str(),
                        );
                        disposition
                    }
                })
                .await;
            if let Err(err) = result {
                error!(error = %err, "indexing consumer failed");
            }
        }
    });

    let flush_task = tokio::spawn({
        let indexer = indexer.clone();
        let mut shutdown = shutdown_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match indexer.flush().await {
                            Ok(0) => {}
                            Ok(count) => observability::register_index_flush("ok", count),
                            Err(err) => {
                                warn!(error = %err, "auto-flush failed");
                                observability::register_index_flush("error", 0);
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            match indexer.flush().await {
                Ok(count) => info!(count, "final index flush complete"),
                Err(err) => error!(error = %err, "final index flush failed"),
            }
        }
    });

    let reconcile_task = tokio::spawn({
        let reconciler = reconciler.clone();
        let mut shutdown = shutdown_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => run_reconcile(&reconciler).await,
                    _ = shutdown.changed() => break,
                }
            }
            // One last drain so shutdown leaves the aggregates current.
            run_reconcile(&reconciler).await;
        }
    });

    info!("all consumers started");
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");

    // Stop deliveries first, then run the final flush and drain passes.
    broker.close().await;
    let _ = shutdown_tx.send(true);

    for task in [
        chat_task,
        message_task,
        indexing_task,
        flush_task,
        reconcile_task,
    ] {
        if let Err(err) = task.await {
            error!(error = %err, "worker task panicked");
        }
    }

    info!("worker stopped");
    Ok(())
}

async fn run_reconcile(reconciler: &CounterReconciler) {
    match reconciler.reconcile().await {
        Ok(true) => observability::register_reconcile_run("ok"),
        Ok(false) => observability::register_reconcile_run("skipped"),
        Err(err) => {
            warn!(error = %err, "reconciliation failed");
            observability::register_reconcile_run("error");
        }
    }
}
