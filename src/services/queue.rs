use crate::config::RabbitMqConfig;
use crate::models::Job;
use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// AMQP delivery mode 2: the broker writes the message to disk.
const PERSISTENT: u8 = 2;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to broker: {0}")]
    Connection(#[source] lapin::Error),

    #[error("Failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("Failed to declare queue '{queue}': {source}")]
    Declare {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("Failed to start consuming: {0}")]
    Consume(#[source] lapin::Error),

    #[error("Broker delivery failed: {0}")]
    Delivery(#[source] lapin::Error),

    #[error("Publish failed: {0}")]
    Publish(#[source] lapin::Error),

    #[error("Publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("Failed to encode job: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Job sink closed")]
    SinkClosed,
}

/// A broker that carries serialized jobs.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Send one already-encoded message, persistent, within the configured
    /// timeout.
    async fn publish(&self, payload: &[u8]) -> Result<(), QueueError>;

    /// Consume the queue until the connection ends, handing each decoded job
    /// to `sink`. Messages are acknowledged on delivery, before the job is
    /// processed.
    async fn receive(&self, sink: mpsc::Sender<Job>) -> Result<(), QueueError>;

    /// Release the broker connection.
    async fn close(&self) -> Result<(), QueueError>;
}

/// Encode `job` and publish it.
pub async fn publish_job(queue: &dyn MessageQueue, job: &Job) -> Result<(), QueueError> {
    let payload = job.to_json().map_err(QueueError::Encode)?;
    queue.publish(&payload).await
}

/// Decode raw message bodies and hand them to `sink` one at a time.
///
/// A slot in `sink` is reserved before the next body is pulled, so with a
/// capacity-one channel at most one decoded job waits ahead of the consumer.
/// Bodies that fail to decode are logged and dropped. Returns the number of
/// jobs forwarded once `deliveries` ends.
pub async fn forward_jobs<S>(deliveries: S, sink: &mpsc::Sender<Job>) -> Result<u64, QueueError>
where
    S: Stream<Item = Result<Vec<u8>, QueueError>>,
{
    let mut deliveries = std::pin::pin!(deliveries);
    let mut forwarded = 0;

    loop {
        let permit = sink.reserve().await.map_err(|_| QueueError::SinkClosed)?;

        let Some(body) = deliveries.next().await else {
            return Ok(forwarded);
        };
        let body = body?;

        match Job::from_json(&body) {
            Ok(job) => {
                tracing::debug!(job_id = job.id, filename = %job.filename, "Job received");
                permit.send(job);
                forwarded += 1;
            }
            Err(e) => {
                let err = QueueError::Decode(e);
                tracing::warn!(bytes = body.len(), "Dropping message: {}", err);
            }
        }
    }
}

pub struct RabbitMqQueue {
    config: RabbitMqConfig,
    connection: Connection,
}

impl RabbitMqQueue {
    pub async fn connect(config: RabbitMqConfig) -> Result<Self, QueueError> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(QueueError::Connection)?;

        Ok(Self { config, connection })
    }

    async fn channel(&self) -> Result<Channel, QueueError> {
        self.connection
            .create_channel()
            .await
            .map_err(QueueError::Channel)
    }
}

async fn close_channel(channel: &Channel) {
    if let Err(e) = channel.close(200, "OK").await {
        tracing::debug!("Failed to close channel: {}", e);
    }
}

#[async_trait]
impl MessageQueue for RabbitMqQueue {
    async fn publish(&self, payload: &[u8]) -> Result<(), QueueError> {
        let channel = self.channel().await?;

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("text/plain".into())
            .with_timestamp(Utc::now().timestamp().max(0) as u64);

        let send = async {
            channel
                .basic_publish(
                    "",
                    &self.config.queue_name,
                    BasicPublishOptions::default(),
                    payload,
                    properties,
                )
                .await?
                .await?;
            Ok::<(), lapin::Error>(())
        };

        let result = tokio::time::timeout(self.config.timeout, send).await;
        close_channel(&channel).await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(QueueError::Publish(e)),
            Err(_) => Err(QueueError::PublishTimeout(self.config.timeout)),
        }
    }

    async fn receive(&self, sink: mpsc::Sender<Job>) -> Result<(), QueueError> {
        let channel = self.channel().await?;

        let queue = channel
            .queue_declare(
                &self.config.queue_name,
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| QueueError::Declare {
                queue: self.config.queue_name.clone(),
                source,
            })?;

        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(QueueError::Consume)?;

        tracing::info!("📬 Consuming from queue '{}'", self.config.queue_name);

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(|delivery| delivery.data)
                .map_err(QueueError::Delivery)
        });
        let result = forward_jobs(deliveries, &sink).await;
        close_channel(&channel).await;

        let forwarded = result?;
        tracing::info!(
            "Queue '{}' consumer ended after {} jobs",
            self.config.queue_name,
            forwarded
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(QueueError::Connection)
    }
}
