use crate::config::{BucketPair, RemovalPolicy};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Part size for multipart uploads. Anything smaller goes up in one request.
const UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create local file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to fetch '{key}': {message}")]
    Fetch { key: String, message: String },

    #[error("Failed to upload '{key}': {message}")]
    Upload { key: String, message: String },

    #[error("Failed to delete '{key}': {message}")]
    Delete { key: String, message: String },

    #[error("Key '{key}' resolves outside its bucket")]
    InvalidKey { key: String },

    #[error("'{key}' still exists after {polls} checks")]
    ConfirmationTimeout { key: String, polls: u32 },

    #[error("Storage {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Object storage bound to a fixed source bucket (read, remove) and a fixed
/// destination bucket (write).
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Stream `source_key` from the source bucket into a new file at
    /// `local_dest`, overwriting it. The returned handle is positioned at the
    /// start of the file.
    async fn download(&self, source_key: &str, local_dest: &Path) -> Result<File, StorageError>;

    /// Stream `reader` into the destination bucket under `destination_key`.
    async fn upload<'a>(
        &self,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        destination_key: &str,
    ) -> Result<(), StorageError>;

    /// Issue the delete for `key` in the source bucket without waiting for it
    /// to take effect.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Whether `key` exists in the source bucket.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    fn removal_policy(&self) -> &RemovalPolicy;

    /// Delete `key` from the source bucket and return only once the object is
    /// confirmed gone.
    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.delete(key).await?;
        let polls = wait_until_absent(key, self.removal_policy(), || self.exists(key)).await?;
        tracing::debug!("Removed '{}' (confirmed after {} checks)", key, polls);
        Ok(())
    }
}

/// Poll `exists` until it reports the object gone, sleeping
/// `policy.poll_interval` between checks. Returns the number of checks made.
pub async fn wait_until_absent<F, Fut>(
    key: &str,
    policy: &RemovalPolicy,
    mut exists: F,
) -> Result<u32, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, StorageError>>,
{
    let max_polls = policy.max_polls.max(1);

    for poll in 1..=max_polls {
        if !exists().await? {
            return Ok(poll);
        }
        tracing::debug!("'{}' still present (check {}/{})", key, poll, max_polls);
        if poll < max_polls {
            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    Err(StorageError::ConfirmationTimeout {
        key: key.to_string(),
        polls: max_polls,
    })
}

/// Open `path` for reading and writing, truncating anything already there.
async fn create_local(path: &Path) -> Result<File, StorageError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|source| StorageError::Create {
            path: path.to_path_buf(),
            source,
        })
}

pub struct S3StorageService {
    client: Client,
    buckets: BucketPair,
    removal: RemovalPolicy,
}

impl S3StorageService {
    pub fn new(client: Client, buckets: BucketPair, removal: RemovalPolicy) -> Self {
        Self {
            client,
            buckets,
            removal,
        }
    }

    async fn put_single(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.buckets.upload)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }

    async fn put_multipart<'a>(
        &self,
        key: &str,
        first_chunk: Vec<u8>,
        reader: &mut (dyn AsyncRead + Unpin + Send + 'a),
    ) -> Result<(), StorageError> {
        let upload_err = |message: String| StorageError::Upload {
            key: key.to_string(),
            message,
        };

        let multipart_upload_res = self
            .client
            .create_multipart_upload()
            .bucket(&self.buckets.upload)
            .key(key)
            .send()
            .await
            .map_err(|e| upload_err(DisplayErrorContext(&e).to_string()))?;

        let upload_id = multipart_upload_res
            .upload_id()
            .ok_or_else(|| upload_err("No upload ID".to_string()))?
            .to_string();

        let result = self
            .upload_parts(key, &upload_id, first_chunk, reader)
            .await;

        if result.is_err() {
            // Leave no orphaned parts behind in the destination bucket.
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.buckets.upload)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                tracing::warn!(
                    "Failed to abort multipart upload {} for '{}': {}",
                    upload_id,
                    key,
                    DisplayErrorContext(&e)
                );
            }
        }

        result
    }

    async fn upload_parts<'a>(
        &self,
        key: &str,
        upload_id: &str,
        first_chunk: Vec<u8>,
        reader: &mut (dyn AsyncRead + Unpin + Send + 'a),
    ) -> Result<(), StorageError> {
        let upload_err = |message: String| StorageError::Upload {
            key: key.to_string(),
            message,
        };

        let mut chunk_index = 1;
        let mut completed_parts = Vec::new();
        let mut chunk = first_chunk;

        while !chunk.is_empty() {
            let upload_part_res = self
                .client
                .upload_part()
                .bucket(&self.buckets.upload)
                .key(key)
                .upload_id(upload_id)
                .body(ByteStream::from(chunk))
                .part_number(chunk_index)
                .send()
                .await
                .map_err(|e| upload_err(DisplayErrorContext(&e).to_string()))?;

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(upload_part_res.e_tag().unwrap_or_default())
                    .part_number(chunk_index)
                    .build(),
            );

            chunk_index += 1;
            chunk = read_chunk(reader).await?;
        }

        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.buckets.upload)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_multipart_upload)
            .send()
            .await
            .map_err(|e| upload_err(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }
}

/// Fill up to one upload chunk from `reader`. A short chunk means EOF.
async fn read_chunk<'a>(
    reader: &mut (dyn AsyncRead + Unpin + Send + 'a),
) -> Result<Vec<u8>, StorageError> {
    let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
    let mut n = 0;
    while n < UPLOAD_CHUNK_SIZE {
        let read = reader.read(&mut buffer[n..]).await?;
        if read == 0 {
            break;
        }
        n += read;
    }
    buffer.truncate(n);
    Ok(buffer)
}

#[async_trait]
impl StorageService for S3StorageService {
    async fn download(&self, source_key: &str, local_dest: &Path) -> Result<File, StorageError> {
        let mut file = create_local(local_dest).await?;

        let object = self
            .client
            .get_object()
            .bucket(&self.buckets.download)
            .key(source_key)
            .send()
            .await
            .map_err(|e| StorageError::Fetch {
                key: source_key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let mut body = object.body.into_async_read();
        let written = tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| StorageError::Fetch {
                key: source_key.to_string(),
                message: e.to_string(),
            })?;
        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;

        tracing::debug!(
            "Downloaded s3://{}/{} ({} bytes) to {}",
            self.buckets.download,
            source_key,
            written,
            local_dest.display()
        );
        Ok(file)
    }

    async fn upload<'a>(
        &self,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        destination_key: &str,
    ) -> Result<(), StorageError> {
        let first_chunk = read_chunk(reader.as_mut()).await?;

        if first_chunk.len() < UPLOAD_CHUNK_SIZE {
            self.put_single(destination_key, first_chunk).await?;
        } else {
            self.put_multipart(destination_key, first_chunk, reader.as_mut())
                .await?;
        }

        tracing::debug!(
            "Uploaded s3://{}/{}",
            self.buckets.upload,
            destination_key
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.buckets.download)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        tracing::debug!("Requested delete of s3://{}/{}", self.buckets.download, key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let res = self
            .client
            .head_object()
            .bucket(&self.buckets.download)
            .key(key)
            .send()
            .await;

        match res {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(StorageError::Fetch {
                        key: key.to_string(),
                        message: DisplayErrorContext(&service_error).to_string(),
                    })
                }
            }
        }
    }

    fn removal_policy(&self) -> &RemovalPolicy {
        &self.removal
    }
}

/// Buckets as directories under a root: `<root>/<bucket>/<key>`.
pub struct LocalStorageService {
    root: PathBuf,
    buckets: BucketPair,
    removal: RemovalPolicy,
}

impl LocalStorageService {
    pub fn new(root: impl Into<PathBuf>, buckets: BucketPair, removal: RemovalPolicy) -> Self {
        Self {
            root: root.into(),
            buckets,
            removal,
        }
    }

    pub fn source_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        self.object_path(&self.buckets.download, key)
    }

    pub fn destination_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        self.object_path(&self.buckets.upload, key)
    }

    /// Resolve `key` under `bucket`. Absolute keys and parent references are
    /// rejected.
    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let mut relative = PathBuf::new();
        for component in Path::new(key).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidKey {
                        key: key.to_string(),
                    });
                }
            }
        }

        if relative.as_os_str().is_empty() {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(bucket).join(relative))
    }

    /// Create both bucket directories.
    pub async fn ensure_buckets(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(self.root.join(&self.buckets.download)).await?;
        tokio::fs::create_dir_all(self.root.join(&self.buckets.upload)).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageService for LocalStorageService {
    async fn download(&self, source_key: &str, local_dest: &Path) -> Result<File, StorageError> {
        let source_path = self.source_path(source_key)?;
        let mut file = create_local(local_dest).await?;

        let mut source = File::open(source_path)
            .await
            .map_err(|e| StorageError::Fetch {
                key: source_key.to_string(),
                message: e.to_string(),
            })?;

        tokio::io::copy(&mut source, &mut file)
            .await
            .map_err(|e| StorageError::Fetch {
                key: source_key.to_string(),
                message: e.to_string(),
            })?;
        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;
        Ok(file)
    }

    async fn upload<'a>(
        &self,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        destination_key: &str,
    ) -> Result<(), StorageError> {
        let upload_err = |e: std::io::Error| StorageError::Upload {
            key: destination_key.to_string(),
            message: e.to_string(),
        };

        let dest = self.destination_path(destination_key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(upload_err)?;
        }

        let mut file = File::create(&dest).await.map_err(upload_err)?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(upload_err)?;
        file.flush().await.map_err(upload_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.source_path(key)?).await {
            Ok(()) => Ok(()),
            // Deleting a missing object succeeds, as it does on S3.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Delete {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::try_exists(self.source_path(key)?).await?)
    }

    fn removal_policy(&self) -> &RemovalPolicy {
        &self.removal
    }
}
