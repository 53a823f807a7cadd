use crate::models::Job;
use std::path::{Component, Path};

/// Longest filename we are willing to stage on local disk.
pub const MAX_FILENAME_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validates the filename half of a job. The filename becomes the last
/// component of the scratch path, so it must be a single plain component.
pub fn validate_filename(filename: &str) -> Result<(), ValidationError> {
    if filename.is_empty() {
        return Err(ValidationError {
            code: "INVALID_FILENAME",
            message: "Filename cannot be empty".to_string(),
        });
    }

    if filename.contains('/') || filename.contains('\\') {
        tracing::warn!("Path separator in job filename: {}", filename);
        return Err(ValidationError {
            code: "INVALID_FILENAME",
            message: format!("Filename '{}' must not contain path separators", filename),
        });
    }

    if filename == "." || filename == ".." {
        return Err(ValidationError {
            code: "INVALID_FILENAME",
            message: format!("Filename '{}' is reserved", filename),
        });
    }

    if filename.chars().any(|c| c.is_control()) {
        return Err(ValidationError {
            code: "INVALID_FILENAME",
            message: "Filename contains control characters".to_string(),
        });
    }

    if filename.len() > MAX_FILENAME_LEN {
        return Err(ValidationError {
            code: "FILENAME_TOO_LONG",
            message: format!(
                "Filename is {} bytes, maximum is {}",
                filename.len(),
                MAX_FILENAME_LEN
            ),
        });
    }

    Ok(())
}

/// Validates the key prefix of a job. Nested prefixes like `2024/01` are
/// fine; empty or absolute prefixes and parent references are not.
pub fn validate_key_prefix(path: &str) -> Result<(), ValidationError> {
    // An empty prefix yields the key "/filename".
    if path.trim().is_empty() {
        return Err(ValidationError {
            code: "INVALID_PATH",
            message: "Path cannot be empty".to_string(),
        });
    }

    if path.starts_with('/') || path.starts_with('\\') {
        return Err(ValidationError {
            code: "INVALID_PATH",
            message: format!("Path '{}' must be relative", path),
        });
    }

    let traverses = Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
    if traverses {
        tracing::warn!("Path traversal attempt detected: {}", path);
        return Err(ValidationError {
            code: "PATH_TRAVERSAL",
            message: format!("Path '{}' must not reference parent directories", path),
        });
    }

    Ok(())
}

/// Runs every check a job must pass before the worker does any I/O for it.
pub fn validate_job(job: &Job) -> Result<(), ValidationError> {
    validate_filename(&job.filename)?;
    validate_key_prefix(&job.path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("a.txt").is_ok());
        assert!(validate_filename("my file.doc").is_ok());
        assert!(validate_filename("测试.txt").is_ok());

        assert_eq!(validate_filename("").unwrap_err().code, "INVALID_FILENAME");
        assert!(validate_filename("../../etc/passwd").is_err());
        assert!(validate_filename("dir\\file").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("bad\nname").is_err());
        assert_eq!(
            validate_filename(&"x".repeat(MAX_FILENAME_LEN + 1))
                .unwrap_err()
                .code,
            "FILENAME_TOO_LONG"
        );
    }

    #[test]
    fn test_validate_key_prefix() {
        assert!(validate_key_prefix("2024/01").is_ok());
        assert!(validate_key_prefix("users").is_ok());
        assert_eq!(validate_key_prefix("").unwrap_err().code, "INVALID_PATH");
        assert_eq!(validate_key_prefix("  ").unwrap_err().code, "INVALID_PATH");

        assert_eq!(
            validate_key_prefix("2024/../secrets").unwrap_err().code,
            "PATH_TRAVERSAL"
        );
        assert_eq!(validate_key_prefix("/etc").unwrap_err().code, "INVALID_PATH");
    }

    #[test]
    fn test_validate_job() {
        assert!(validate_job(&Job::new("a.txt", "2024/01", 42)).is_ok());
        assert!(validate_job(&Job::new("a/b.txt", "2024/01", 42)).is_err());
        assert!(validate_job(&Job::new("a.txt", "../up", 42)).is_err());
        assert!(validate_job(&Job::new("a.txt", "", 42)).is_err());
    }
}
