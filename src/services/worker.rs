use crate::config::WorkerConfig;
use crate::models::Job;
use crate::services::compression::{self, TransformError};
use crate::services::storage::{StorageError, StorageService};
use crate::utils::validation::{ValidationError, validate_job};
use std::fmt;
use std::future::Future;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

/// Steps a job moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Download,
    Read,
    Transform,
    Upload,
    Cleanup,
    RemoveSource,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::Download => "download",
            Stage::Read => "read",
            Stage::Transform => "transform",
            Stage::Upload => "upload",
            Stage::Cleanup => "cleanup",
            Stage::RemoveSource => "remove_source",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error("Download failed: {0}")]
    Download(#[source] StorageError),

    #[error("Failed to read scratch file: {0}")]
    Read(#[source] std::io::Error),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Upload failed: {0}")]
    Upload(#[source] StorageError),

    #[error("Failed to remove scratch file: {0}")]
    Cleanup(#[source] std::io::Error),

    #[error("Failed to remove source object: {0}")]
    RemoveSource(#[source] StorageError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Validation(_) => Stage::Validate,
            PipelineError::Download(_) => Stage::Download,
            PipelineError::Read(_) => Stage::Read,
            PipelineError::Transform(_) => Stage::Transform,
            PipelineError::Upload(_) => Stage::Upload,
            PipelineError::Cleanup(_) => Stage::Cleanup,
            PipelineError::RemoveSource(_) => Stage::RemoveSource,
        }
    }
}

/// What a successfully processed job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub key: String,
    pub bytes_in: usize,
    pub bytes_out: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub succeeded: u64,
    pub failed: u64,
}

/// Pulls jobs off the handoff channel and runs each one to completion
/// before taking the next.
pub struct PipelineWorker {
    storage: Arc<dyn StorageService>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl PipelineWorker {
    pub fn new(
        storage: Arc<dyn StorageService>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            storage,
            config,
            shutdown,
        }
    }

    /// Process jobs until the channel closes or shutdown is signalled.
    pub async fn run(mut self, mut jobs: mpsc::Receiver<Job>) -> WorkerStats {
        tracing::info!(
            "🚀 Pipeline worker started (scratch: {}, transform: {:?})",
            self.config.scratch_dir.display(),
            self.config.transform
        );
        let mut stats = WorkerStats::default();

        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::info!("🛑 Pipeline worker shutting down");
                        break;
                    }
                }
                job = jobs.recv() => {
                    let Some(job) = job else {
                        tracing::info!("Job channel closed, pipeline worker stopping");
                        break;
                    };
                    if self.handle(job).await {
                        stats.succeeded += 1;
                    } else {
                        stats.failed += 1;
                    }
                }
            }
        }

        tracing::info!(
            "Pipeline worker stopped: {} succeeded, {} failed",
            stats.succeeded,
            stats.failed
        );
        stats
    }

    /// Run one job and log its outcome. Failures never escape this call.
    pub async fn handle(&self, job: Job) -> bool {
        let span = tracing::info_span!("job", job_id = job.id, filename = %job.filename);

        async {
            match self.process(&job).await {
                Ok(report) => {
                    tracing::info!(
                        "✅ Compacted '{}' ({} -> {} bytes)",
                        report.key,
                        report.bytes_in,
                        report.bytes_out
                    );
                    true
                }
                Err(e) => {
                    tracing::error!(
                        job_id = job.id,
                        filename = %job.filename,
                        path = %job.path,
                        stage = %e.stage(),
                        "❌ Job failed: {}",
                        e
                    );
                    false
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Download, transform, upload, then delete the scratch copy.
    ///
    /// An early failure leaves whatever was already written at the scratch
    /// path in place.
    pub async fn process(&self, job: &Job) -> Result<JobReport, PipelineError> {
        validate_job(job)?;

        let key = job.source_key();
        let scratch = job.scratch_path_in(&self.config.scratch_dir);

        if let Some(parent) = scratch.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| {
                PipelineError::Download(StorageError::Create {
                    path: parent.to_path_buf(),
                    source,
                })
            })?;
        }

        let mut file = self
            .with_deadline("download", self.storage.download(&key, &scratch))
            .await
            .map_err(PipelineError::Download)?;
        tracing::debug!("Downloaded '{}' to {}", key, scratch.display());

        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .await
            .map_err(PipelineError::Read)?;
        drop(file);
        let bytes_in = content.len();

        let payload = compression::transform(&content, self.config.transform)?;
        drop(content);
        let bytes_out = payload.len();
        tracing::debug!("Transformed {} bytes into {} bytes", bytes_in, bytes_out);

        self.with_deadline("upload", self.storage.upload(Box::new(Cursor::new(payload)), &key))
            .await
            .map_err(PipelineError::Upload)?;
        tracing::debug!("Uploaded '{}'", key);

        tokio::fs::remove_file(&scratch)
            .await
            .map_err(PipelineError::Cleanup)?;
        remove_empty_parent(&scratch, &self.config.scratch_dir).await;

        if self.config.delete_source {
            self.with_deadline("remove", self.storage.remove(&key))
                .await
                .map_err(PipelineError::RemoveSource)?;
            tracing::debug!("Removed source object '{}'", key);
        }

        Ok(JobReport {
            key,
            bytes_in,
            bytes_out,
        })
    }

    async fn with_deadline<T, F>(&self, operation: &'static str, call: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match self.config.storage_timeout {
            None => call.await,
            Some(after) => tokio::time::timeout(after, call)
                .await
                .map_err(|_| StorageError::Timeout { operation, after })?,
        }
    }
}

/// Drop the per-job `id/` directory if nothing else lives in it.
async fn remove_empty_parent(scratch: &Path, scratch_root: &Path) {
    let Some(parent) = scratch.parent() else {
        return;
    };
    if parent == scratch_root {
        return;
    }

    match tokio::fs::remove_dir(parent).await {
        Ok(()) => {}
        // Another file for the same id is still in there.
        Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {}
        Err(e) => tracing::debug!(
            "Failed to remove scratch directory {}: {}",
            parent.display(),
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_empty_parent() {
        let root = tempfile::tempdir().unwrap();

        let job_dir = root.path().join("42");
        tokio::fs::create_dir(&job_dir).await.unwrap();
        remove_empty_parent(&job_dir.join("a.txt"), root.path()).await;
        assert!(!job_dir.exists());

        // a sibling file keeps the directory alive
        let busy_dir = root.path().join("43");
        tokio::fs::create_dir(&busy_dir).await.unwrap();
        tokio::fs::write(busy_dir.join("b.txt"), b"x").await.unwrap();
        remove_empty_parent(&busy_dir.join("a.txt"), root.path()).await;
        assert!(busy_dir.join("b.txt").exists());

        // already gone is fine, and the root itself is never removed
        remove_empty_parent(&job_dir.join("a.txt"), root.path()).await;
        remove_empty_parent(&root.path().join("a.txt"), root.path()).await;
        assert!(root.path().exists());
    }

    #[test]
    fn test_error_stage() {
        let err = PipelineError::Upload(StorageError::Upload {
            key: "k".to_string(),
            message: "boom".to_string(),
        });
        assert_eq!(err.stage(), Stage::Upload);
        assert_eq!(err.stage().to_string(), "upload");

        let err: PipelineError = ValidationError {
            code: "INVALID_FILENAME",
            message: "empty".to_string(),
        }
        .into();
        assert_eq!(err.stage(), Stage::Validate);
    }
}
