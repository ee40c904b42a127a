use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parley_domain::consumers::Disposition;
use parley_domain::model::QueueName;
use parley_domain::ports::BoxFuture;
use parley_domain::ports::broker::{BrokerError, Publisher};
use serde_json::Value;
use tracing::{info, warn};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const PREFETCH_COUNT: u16 = 1;
const PERSISTENT_DELIVERY: u8 = 2;

/// One long-lived AMQP connection/channel pair. The three queues are
/// declared durable at connect time so either process can start first.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(amqp_url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .map_err(|err| BrokerError::Unavailable(err.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| BrokerError::Unavailable(err.to_string()))?;

        for queue in QueueName::ALL {
            channel
                .queue_declare(
                    queue.as_str(),
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| BrokerError::Unavailable(err.to_string()))?;
            info!(queue = queue.as_str(), "declared durable queue");
        }

        Ok(Self {
            connection,
            channel,
        })
    }

    /// Consume `queue` with prefetch 1 and manual acknowledgment, mapping
    /// each handled delivery's disposition to ack / ack-drop / requeue.
    /// Runs until the channel closes.
    pub async fn run_consumer<H, Fut>(&self, queue: QueueName, handler: H) -> Result<(), BrokerError>
    where
        H: Fn(Vec<u8>) -> Fut,
        Fut: std::future::Future<Output = Disposition>,
    {
        self.channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(|err| BrokerError::Unavailable(err.to_string()))?;

        let mut consumer = self
            .channel
            .basic_consume(
                queue.as_str(),
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError::Unavailable(err.to_string()))?;

        info!(queue = queue.as_str(), "consumer started");

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(err) => {
                    warn!(queue = queue.as_str(), error = %err, "broken delivery");
                    continue;
                }
            };

            let disposition = handler(delivery.data.clone()).await;
            let acked = match disposition {
                Disposition::Completed | Disposition::Discard => {
                    delivery.ack(BasicAckOptions::default()).await
                }
                Disposition::Retry => {
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..BasicNackOptions::default()
                        })
                        .await
                }
            };
            if let Err(err) = acked {
                warn!(
                    queue = queue.as_str(),
                    error = %err,
                    disposition = disposition.as_str(),
                    "failed to settle delivery"
                );
            }
        }

        info!(queue = queue.as_str(), "consumer stream ended");
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(err) = self.channel.close(200, "shutdown").await {
            warn!(error = %err, "failed to close channel");
        }
        if let Err(err) = self.connection.close(200, "shutdown").await {
            warn!(error = %err, "failed to close connection");
        }
    }
}

impl Publisher for AmqpBroker {
    fn publish(&self, queue: QueueName, payload: Value) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            let body = serde_json::to_vec(&payload)
                .map_err(|err| BrokerError::Serialization(err.to_string()))?;
            let properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(PERSISTENT_DELIVERY);

            let publish = self.channel.basic_publish(
                "",
                queue.as_str(),
                BasicPublishOptions::default(),
                &body,
                properties,
            );
            tokio::time::timeout(PUBLISH_TIMEOUT, publish)
                .await
                .map_err(|_| BrokerError::Publish("publish timed out".to_string()))?
                .map_err(|err| BrokerError::Publish(err.to_string()))?;
            Ok(())
        })
    }
}
