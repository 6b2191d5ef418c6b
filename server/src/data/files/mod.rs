//! File service
//!
//! Validates uploads, content-addresses them with BLAKE3, stores the bytes
//! through the `FileStorage` seam, and keeps the metadata rows moving
//! through UPLOADING → PROCESSING → COMPLETED. Metadata writes go through
//! the store gateway so file persistence shares the circuit breaker with
//! the message path. Deeper metadata extraction (dimensions, previews,
//! scanning) belongs to the out-of-scope media pipeline; the `metadata`
//! sections stay empty until it fills them.

mod error;
mod filesystem;
mod storage;

use std::sync::Arc;

pub use error::FileError;
pub use filesystem::FilesystemStorage;
pub use storage::{FileStorage, storage_key_for};

use crate::core::config::FilesConfig;
use crate::core::storage::{AppStorage, DataSubdir};
use crate::data::types::{FileMetadata, FileRecord, FileStatus};
use crate::domain::gateway::MessageStoreGateway;
use crate::utils::time::now_millis;

pub struct FileService {
    storage: Arc<dyn FileStorage>,
    gateway: Arc<MessageStoreGateway>,
    config: FilesConfig,
}

impl FileService {
    pub fn new(
        config: FilesConfig,
        app_storage: &AppStorage,
        gateway: Arc<MessageStoreGateway>,
    ) -> Self {
        let backend = FilesystemStorage::new(
            app_storage.subdir(DataSubdir::Files),
            app_storage.subdir(DataSubdir::FilesTemp),
        );
        Self::with_storage(config, Arc::new(backend), gateway)
    }

    pub fn with_storage(
        config: FilesConfig,
        storage: Arc<dyn FileStorage>,
        gateway: Arc<MessageStoreGateway>,
    ) -> Self {
        Self {
            storage,
            gateway,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Accept an upload: validate, hash, persist bytes, complete the record.
    ///
    /// The record is created UPLOADING before the bytes move, so a crash
    /// mid-upload leaves a visible non-terminal row rather than an orphan
    /// object. On storage failure the record enters FAILED (terminal).
    pub async fn store_upload(
        &self,
        uploaded_by: &str,
        original_name: &str,
        mime_type: Option<&str>,
        conversation_id: Option<&str>,
        data: Vec<u8>,
    ) -> Result<FileRecord, FileError> {
        if !self.config.enabled {
            return Err(FileError::Disabled);
        }
        if data.is_empty() {
            return Err(FileError::Empty);
        }
        if data.len() as u64 > self.config.max_size_bytes {
            return Err(FileError::TooLarge {
                size: data.len() as u64,
                max: self.config.max_size_bytes,
            });
        }

        let checksum = blake3::hash(&data).to_hex().to_string();
        let storage_key = storage_key_for(&checksum);
        let mime_type = mime_type.map(str::to_string).unwrap_or_else(|| {
            mime_guess::from_path(original_name)
                .first_or_octet_stream()
                .to_string()
        });
        let now = now_millis();

        let mut record = FileRecord {
            id: uuid::Uuid::now_v7().to_string(),
            original_name: original_name.to_string(),
            storage_key,
            mime_type,
            size: data.len() as i64,
            checksum,
            uploaded_by: uploaded_by.to_string(),
            conversation_id: conversation_id.map(str::to_string),
            message_id: None,
            status: FileStatus::Uploading,
            download_count: 0,
            metadata: FileMetadata::default(),
            created_at: now,
            updated_at: now,
        };

        self.gateway.create_file(&record).await?;

        if let Err(e) = self.storage.upload(&record.storage_key, &data).await {
            tracing::error!(file_id = %record.id, error = %e, "Upload to storage backend failed");
            self.gateway
                .update_file_status(&record.id, FileStatus::Failed)
                .await?;
            return Err(e);
        }

        self.gateway
            .update_file_status(&record.id, FileStatus::Processing)
            .await?;
        self.gateway
            .update_file_status(&record.id, FileStatus::Completed)
            .await?;
        record.status = FileStatus::Completed;

        tracing::debug!(
            file_id = %record.id,
            size = record.size,
            mime = %record.mime_type,
            "File upload completed"
        );

        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<FileRecord>, FileError> {
        Ok(self.gateway.find_file(id).await?)
    }

    /// Resolve the record and bytes for a download; bumps the counter.
    /// Only COMPLETED files are downloadable.
    pub async fn download(&self, id: &str) -> Result<(FileRecord, Vec<u8>), FileError> {
        let record = self
            .gateway
            .find_file(id)
            .await?
            .ok_or_else(|| FileError::NotFound(id.to_string()))?;

        if record.status != FileStatus::Completed {
            return Err(FileError::NotReady(record.id.clone(), record.status.as_str()));
        }

        let data = self.storage.download(&record.storage_key).await?;
        self.gateway.bump_file_download(id).await?;

        Ok((record, data))
    }

    /// Bind an uploaded file to the message that carries it
    pub async fn attach_to_message(
        &self,
        file_id: &str,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<bool, FileError> {
        Ok(self
            .gateway
            .attach_file_to_message(file_id, message_id, conversation_id)
            .await?)
    }

    pub fn backend_name(&self) -> &'static str {
        self.storage.backend_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CircuitConfig;
    use crate::data::sqlite::SqliteService;
    use crate::domain::breaker::CircuitBreaker;

    async fn gateway() -> Arc<MessageStoreGateway> {
        let store = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let breaker = Arc::new(CircuitBreaker::new(CircuitConfig::default()));
        Arc::new(MessageStoreGateway::new(store, breaker, 5_000))
    }

    async fn service_with(config: FilesConfig) -> (tempfile::TempDir, FileService) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FilesystemStorage::new(
            dir.path().join("files"),
            dir.path().join("temp"),
        ));
        let service = FileService::with_storage(config, storage, gateway().await);
        (dir, service)
    }

    async fn service() -> (tempfile::TempDir, FileService) {
        service_with(FilesConfig::default()).await
    }

    #[tokio::test]
    async fn test_upload_completes_and_downloads() {
        let (_dir, service) = service().await;

        let record = service
            .store_upload("alice", "notes.txt", Some("text/plain"), None, b"hello".to_vec())
            .await
            .unwrap();

        assert_eq!(record.status, FileStatus::Completed);
        assert_eq!(record.size, 5);
        assert_eq!(record.mime_type, "text/plain");

        let (found, data) = service.download(&record.id).await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(found.id, record.id);

        // Download counter advanced
        let after = service.get(&record.id).await.unwrap().unwrap();
        assert_eq!(after.download_count, 1);
    }

    #[tokio::test]
    async fn test_mime_guessed_from_name() {
        let (_dir, service) = service().await;
        let record = service
            .store_upload("alice", "photo.png", None, None, vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(record.mime_type, "image/png");
    }

    #[tokio::test]
    async fn test_rejects_empty_and_oversized() {
        let (_dir, service) = service().await;
        assert!(matches!(
            service
                .store_upload("alice", "empty.bin", None, None, vec![])
                .await,
            Err(FileError::Empty)
        ));

        let (_dir, tiny) = service_with(FilesConfig {
            enabled: true,
            max_size_bytes: 4,
        })
        .await;
        assert!(matches!(
            tiny.store_upload("alice", "big.bin", None, None, vec![0; 10])
                .await,
            Err(FileError::TooLarge { size: 10, max: 4 })
        ));
    }

    #[tokio::test]
    async fn test_disabled_service_refuses_uploads() {
        let (_dir, service) = service_with(FilesConfig {
            enabled: false,
            max_size_bytes: 100,
        })
        .await;

        assert!(matches!(
            service
                .store_upload("alice", "f.txt", None, None, b"x".to_vec())
                .await,
            Err(FileError::Disabled)
        ));
        assert!(!service.is_enabled());
    }

    #[tokio::test]
    async fn test_attach_to_message() {
        let (_dir, service) = service().await;
        let record = service
            .store_upload("alice", "doc.pdf", None, Some("c1"), b"pdf".to_vec())
            .await
            .unwrap();

        assert!(service.attach_to_message(&record.id, "m1", "c1").await.unwrap());

        let after = service.get(&record.id).await.unwrap().unwrap();
        assert_eq!(after.message_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_upload_fails_fast_when_circuit_open() {
        let (_dir, service) = service().await;

        for _ in 0..CircuitConfig::default().failure_threshold {
            service.gateway.breaker().record_failure();
        }

        let err = service
            .store_upload("alice", "f.txt", None, None, b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FileError::Store(crate::domain::gateway::GatewayError::CircuitOpen)
        ));
    }
}
