use crate::config::{S3Config, StorageBackend};
use crate::services::storage::{LocalStorageService, S3StorageService, StorageService};
use anyhow::{Context, Result};
use aws_sdk_s3::config::{Credentials, Region};
use std::sync::Arc;
use tracing::info;

pub async fn setup_storage(backend: &StorageBackend) -> Result<Arc<dyn StorageService>> {
    match backend {
        StorageBackend::S3(config) => {
            let client = s3_client(config).await;
            verify_buckets(&client, config).await?;
            Ok(Arc::new(S3StorageService::new(
                client,
                config.buckets.clone(),
                config.removal,
            )))
        }
        StorageBackend::Local(config) => {
            info!(
                "📁 Local Storage: {} (Buckets: {} -> {})",
                config.root.display(),
                config.buckets.download,
                config.buckets.upload
            );
            let storage =
                LocalStorageService::new(config.root.clone(), config.buckets.clone(), config.removal);
            storage
                .ensure_buckets()
                .await
                .context("Failed to prepare local storage buckets")?;
            Ok(Arc::new(storage))
        }
    }
}

pub async fn s3_client(config: &S3Config) -> aws_sdk_s3::Client {
    info!(
        "☁️  S3 Storage: {} (Buckets: {} -> {})",
        config.endpoint_url.as_deref().unwrap_or("aws"),
        config.buckets.download,
        config.buckets.upload
    );

    let mut loader = aws_config::from_env()
        .region(Region::new(config.region.clone()))
        .credentials_provider(Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "static",
        ));
    if let Some(endpoint_url) = &config.endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }
    let aws_config = loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(config.endpoint_url.is_some())
        .build();

    aws_sdk_s3::Client::from_conf(s3_config)
}

/// The source bucket must already exist; the destination bucket is created
/// when missing.
async fn verify_buckets(client: &aws_sdk_s3::Client, config: &S3Config) -> Result<()> {
    let source = &config.buckets.download;
    client
        .head_bucket()
        .bucket(source)
        .send()
        .await
        .with_context(|| format!("Source bucket '{}' is not reachable", source))?;
    info!("✅ Bucket '{}' is ready", source);

    let destination = &config.buckets.upload;
    match client.head_bucket().bucket(destination).send().await {
        Ok(_) => info!("✅ Bucket '{}' is ready", destination),
        Err(_) => {
            info!("🪣 Bucket '{}' not found, creating...", destination);
            client
                .create_bucket()
                .bucket(destination)
                .send()
                .await
                .with_context(|| format!("Failed to create bucket '{}'", destination))?;
            info!("✅ Bucket '{}' created successfully", destination);
        }
    }

    Ok(())
}
