use clap::Parser;
use dotenvy::dotenv;
use drive_compactor::Job;
use drive_compactor::config::QueueBackend;
use drive_compactor::infrastructure::queue;
use drive_compactor::services::queue::publish_job;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Publish one compaction job to the worker queue.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Object name inside the source bucket prefix
    #[arg(short, long)]
    filename: String,

    /// Key prefix in the source bucket, e.g. 2024/01
    #[arg(short, long)]
    path: String,

    /// Upload id; names the worker's scratch directory
    #[arg(short, long)]
    id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "enqueue=info,drive_compactor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let backend = QueueBackend::from_env()?;
    let queue_service = queue::setup_queue(&backend).await?;

    let job = Job::new(args.filename, args.path, args.id);
    let result = publish_job(queue_service.as_ref(), &job).await;

    if let Err(e) = queue_service.close().await {
        error!("⚠️  Failed to close broker connection: {}", e);
    }

    match result {
        Ok(()) => {
            info!("📨 Queued '{}' (id {})", job.source_key(), job.id);
            Ok(())
        }
        Err(e) => {
            error!("❌ Failed to queue job: {}", e);
            Err(e.into())
        }
    }
}
