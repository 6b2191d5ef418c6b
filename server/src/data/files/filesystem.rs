//! Filesystem-based file storage implementation
//!
//! Stores objects under `{base_path}/{key}` where the key is already
//! sharded (`ab/cd/abcd...`). Writes go through a temp file + rename so a
//! crash mid-write never leaves a partial object at the final path.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::error::FileError;
use super::storage::FileStorage;

/// Filesystem-based file storage
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    /// Base path for stored objects
    base_path: PathBuf,
    /// Scratch directory for in-flight writes (same filesystem as base)
    temp_path: PathBuf,
}

impl FilesystemStorage {
    pub fn new(base_path: PathBuf, temp_path: PathBuf) -> Self {
        Self {
            base_path,
            temp_path,
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, FileError> {
        Self::validate_key(key)?;
        Ok(self.base_path.join(key))
    }

    /// Keys are hash-derived: hex shards and hex filename only
    fn validate_key(key: &str) -> Result<(), FileError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == '/')
            && !key.contains("//")
            && !key.starts_with('/')
            && !key.ends_with('/');
        if !valid {
            return Err(FileError::Backend(format!("invalid storage key: {key}")));
        }
        Ok(())
    }

    async fn ensure_parent_dirs(path: &Path) -> Result<(), FileError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileStorage for FilesystemStorage {
    async fn upload(&self, key: &str, data: &[u8]) -> Result<(), FileError> {
        let path = self.object_path(key)?;

        // Content-addressed: identical key means identical bytes
        if path.exists() {
            tracing::trace!(key, "Object already exists, skipping write");
            return Ok(());
        }

        Self::ensure_parent_dirs(&path).await?;

        // Write to temp, then rename into place (atomic on one filesystem)
        fs::create_dir_all(&self.temp_path).await?;
        let temp_file = self.temp_path.join(format!("upload-{}", cuid2::create_id()));
        fs::write(&temp_file, data).await?;
        if let Err(e) = fs::rename(&temp_file, &path).await {
            let _ = fs::remove_file(&temp_file).await;
            return Err(e.into());
        }

        tracing::debug!(key, size = data.len(), path = %path.display(), "Object stored");
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, FileError> {
        let path = self.object_path(key)?;

        // Read directly; map ENOENT to NotFound instead of a separate
        // exists() check, which would be a TOCTOU race.
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FileError::NotFound(key.to_string())
            } else {
                FileError::Io(e)
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<(), FileError> {
        let path = self.object_path(key)?;

        if path.exists() {
            fs::remove_file(&path).await?;
            tracing::debug!(key, "Object deleted");
        }

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, FileError> {
        let path = self.object_path(key)?;
        Ok(path.exists())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, FilesystemStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path().join("files"), dir.path().join("temp"));
        (dir, storage)
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let (_dir, storage) = storage();

        storage.upload("ab/cd/abcd12", b"hello").await.unwrap();
        let data = storage.download("ab/cd/abcd12").await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_upload_is_idempotent() {
        let (_dir, storage) = storage();

        storage.upload("ab/cd/abcd12", b"hello").await.unwrap();
        storage.upload("ab/cd/abcd12", b"ignored").await.unwrap();

        // First write wins (content-addressed keys never change content)
        let data = storage.download("ab/cd/abcd12").await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let (_dir, storage) = storage();
        let err = storage.download("ab/cd/abcd12").await.unwrap_err();
        assert!(matches!(err, FileError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_is_tolerant() {
        let (_dir, storage) = storage();

        storage.upload("ab/cd/abcd12", b"x").await.unwrap();
        assert!(storage.exists("ab/cd/abcd12").await.unwrap());

        storage.delete("ab/cd/abcd12").await.unwrap();
        assert!(!storage.exists("ab/cd/abcd12").await.unwrap());

        // Second delete is a no-op
        storage.delete("ab/cd/abcd12").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let (_dir, storage) = storage();
        assert!(storage.download("../etc/passwd").await.is_err());
        assert!(storage.upload("/abs/path", b"x").await.is_err());
        assert!(storage.upload("", b"x").await.is_err());
    }
}
