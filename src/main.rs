use anyhow::Context;
use dotenvy::dotenv;
use drive_compactor::infrastructure::{queue, storage};
use drive_compactor::services::worker::PipelineWorker;
use drive_compactor::{AppConfig, Job};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initial Environment & Logging Setup
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drive_compactor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting drive-compactor worker...");

    let config = AppConfig::from_env().context("Invalid configuration")?;

    // 2. Connect backends; failing here is fatal
    let queue_service = queue::setup_queue(&config.queue).await?;
    let storage_service = storage::setup_storage(&config.storage).await?;

    // 3. Single-slot handoff between the consumer and the worker
    let (job_tx, job_rx) = mpsc::channel::<Job>(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer_queue = queue_service.clone();
    let mut consumer = tokio::spawn(async move { consumer_queue.receive(job_tx).await });

    let worker = PipelineWorker::new(storage_service, config.worker.clone(), shutdown_rx);
    let worker_handle = tokio::spawn(worker.run(job_rx));
    info!("👷 Pipeline worker initialized.");

    // 4. Run until a signal arrives or the consumer stops
    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            Ok(())
        }
        res = &mut consumer => match res {
            Ok(Ok(())) => {
                info!("📭 Queue consumer finished");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("❌ Queue consumer failed: {}", e);
                Err(anyhow::Error::new(e).context("Queue consumer failed"))
            }
            Err(e) => Err(anyhow::Error::new(e).context("Queue consumer task panicked")),
        },
    };

    info!("🛑 Shutting down worker services...");

    match worker_handle.await {
        Ok(stats) => info!(
            "📊 Processed {} jobs ({} failed)",
            stats.succeeded + stats.failed,
            stats.failed
        ),
        Err(e) => error!("❌ Pipeline worker task failed: {}", e),
    }

    consumer.abort();
    if let Err(e) = queue_service.close().await {
        warn!("⚠️  Failed to close broker connection: {}", e);
    }

    if outcome.is_ok() {
        info!("👋 drive-compactor exited cleanly.");
    }
    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
