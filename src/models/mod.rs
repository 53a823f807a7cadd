use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A unit of work announced by the upstream uploader: one file that landed in
/// the source bucket and should be recompressed into the destination bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub filename: String,
    pub path: String,
    pub id: i64,
}

impl Job {
    pub fn new(filename: impl Into<String>, path: impl Into<String>, id: i64) -> Self {
        Self {
            filename: filename.into(),
            path: path.into(),
            id,
        }
    }

    /// Decode a raw message body.
    pub fn from_json(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Key of the object in the source bucket. The destination object is
    /// written under the same key.
    pub fn source_key(&self) -> String {
        format!("{}/{}", self.path, self.filename)
    }

    /// Relative scratch location, `id/filename`.
    pub fn scratch_path(&self) -> PathBuf {
        PathBuf::from(self.id.to_string()).join(&self.filename)
    }

    /// Scratch location resolved under the worker's scratch root.
    pub fn scratch_path_in(&self, root: &Path) -> PathBuf {
        root.join(self.scratch_path())
    }
}
