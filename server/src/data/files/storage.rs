//! File storage trait definition
//!
//! The seam for storage backends. The filesystem implementation ships
//! in-tree; S3/SFTP adapters are external collaborators that plug into the
//! same contract.

use async_trait::async_trait;

use super::error::FileError;

/// Trait for file storage backends
///
/// All implementations must be thread-safe (Send + Sync) for use in async
/// contexts. Objects are content-addressed: the storage key is derived from
/// the content hash, so storing the same bytes twice is a no-op.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Store an object under `key`. Idempotent for identical content.
    async fn upload(&self, key: &str, data: &[u8]) -> Result<(), FileError>;

    /// Retrieve an object. `NotFound` when the key does not resolve.
    async fn download(&self, key: &str) -> Result<Vec<u8>, FileError>;

    /// Remove an object. Does not fail if the key is already gone.
    async fn delete(&self, key: &str) -> Result<(), FileError>;

    /// Check whether the key resolves
    async fn exists(&self, key: &str) -> Result<bool, FileError>;

    /// Backend name for debugging/logging
    fn backend_name(&self) -> &'static str;
}

/// Sharded storage key for a content hash:
/// `{hash[0:2]}/{hash[2:4]}/{hash}`
pub fn storage_key_for(hash: &str) -> String {
    format!("{}/{}/{}", &hash[0..2], &hash[2..4], hash)
}
