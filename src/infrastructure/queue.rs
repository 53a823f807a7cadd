use crate::config::QueueBackend;
use crate::services::queue::{MessageQueue, RabbitMqQueue};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

pub async fn setup_queue(backend: &QueueBackend) -> Result<Arc<dyn MessageQueue>> {
    match backend {
        QueueBackend::RabbitMq(config) => {
            info!(
                "🐇 RabbitMQ: queue '{}' (publish timeout {:?})",
                config.queue_name, config.timeout
            );
            let queue = RabbitMqQueue::connect(config.clone())
                .await
                .context("Failed to connect to the queue")?;
            info!("✅ Broker connected successfully");
            Ok(Arc::new(queue))
        }
    }
}
