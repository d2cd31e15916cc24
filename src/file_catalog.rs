use crate::dedup::DedupGuard;
use crate::object_store::{ForwardedOrigin, ObjectStore, StoreError, UrlRewriter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Marker carried in the name of perception record files
pub const PERCEPTION_MARKER: &str = "ROS_PERCEPTION_DATA";

const DOWNLOAD_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("file {0} not found")]
    NotFound(i64),

    #[error("file registry error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A file about to be registered
#[derive(Debug, Clone, PartialEq)]
pub struct NewFile {
    pub name: String,
    /// Object key in the store
    pub path: String,
    pub size: i64,
    pub content_type: String,
    pub created_by: i64,
}

/// A registered, first-class stored file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredFile {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub path_hash: i64,
    pub size: i64,
    pub content_type: String,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
}

/// Persistence of stored file rows
#[async_trait]
pub trait FileRegistry: Send + Sync {
    async fn insert_files(
        &self,
        files: &[(NewFile, i64)],
    ) -> Result<Vec<StoredFile>, CatalogError>;

    async fn find_files(&self, ids: &[i64]) -> Result<Vec<StoredFile>, CatalogError>;

    async fn delete_files(&self, ids: &[i64]) -> Result<u64, CatalogError>;
}

/// 64-bit hash of an object path: the first eight bytes of its SHA-256
pub fn path_hash(path: &str) -> i64 {
    let digest = Sha256::digest(path.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

pub fn is_perception_record(name: &str) -> bool {
    name.contains(PERCEPTION_MARKER) && name.ends_with(".json")
}

/// Registers stored files and serves them back out
pub struct FileCatalog {
    registry: Arc<dyn FileRegistry>,
    store: Arc<dyn ObjectStore>,
    dedup: Arc<dyn DedupGuard>,
    rewriter: UrlRewriter,
}

impl FileCatalog {
    pub fn new(
        registry: Arc<dyn FileRegistry>,
        store: Arc<dyn ObjectStore>,
        dedup: Arc<dyn DedupGuard>,
        rewriter: UrlRewriter,
    ) -> Self {
        Self {
            registry,
            store,
            dedup,
            rewriter,
        }
    }

    /// Register files, skipping perception records whose path was already seen
    #[instrument(skip(self, files), fields(count = files.len()))]
    pub async fn register(&self, files: Vec<NewFile>) -> Result<Vec<StoredFile>, CatalogError> {
        let mut accepted = Vec::with_capacity(files.len());
        let mut claimed = Vec::new();

        for file in files {
            let hash = path_hash(&file.path);
            if is_perception_record(&file.name) {
                if !self.dedup.insert_if_absent(hash) {
                    debug!(path = %file.path, "Perception record already ingested, skipping");
                    continue;
                }
                claimed.push(hash);
            }
            accepted.push((file, hash));
        }

        if accepted.is_empty() {
            return Ok(Vec::new());
        }

        match self.registry.insert_files(&accepted).await {
            Ok(stored) => {
                info!(registered = stored.len(), "Files registered");
                Ok(stored)
            }
            Err(e) => {
                // Nothing was ingested, so a retry must not be skipped
                for hash in claimed {
                    self.dedup.remove(hash);
                }
                Err(e)
            }
        }
    }

    /// Delete files from the store and the registry.
    ///
    /// Object removal failures are logged; registry rows are removed regardless.
    #[instrument(skip(self))]
    pub async fn delete_by_ids(&self, ids: &[i64]) -> Result<u64, CatalogError> {
        let files = self.registry.find_files(ids).await?;

        for file in &files {
            if let Err(e) = self.store.delete(&file.path).await {
                warn!(file_id = file.id, path = %file.path, error = %e, "Failed to remove object");
            }
        }

        self.registry.delete_files(ids).await
    }

    /// Presigned download URL for a file, rewritten for the caller's origin
    pub async fn download_url(
        &self,
        id: i64,
        origin: &ForwardedOrigin,
    ) -> Result<String, CatalogError> {
        let file = self
            .registry
            .find_files(&[id])
            .await?
            .into_iter()
            .next()
            .ok_or(CatalogError::NotFound(id))?;

        let url = self
            .store
            .presign_get(&file.path, Some(DOWNLOAD_CONTENT_TYPE))
            .await?;
        Ok(self.rewriter.to_external(&url, origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::BoundedDedup;
    use crate::object_store::{DeleteReport, PresignedUpload};
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Registry whose first `failures` inserts are rejected
    #[derive(Default)]
    struct FlakyRegistry {
        failures: AtomicUsize,
        rows: Mutex<Vec<StoredFile>>,
    }

    #[async_trait]
    impl FileRegistry for FlakyRegistry {
        async fn insert_files(
            &self,
            files: &[(NewFile, i64)],
        ) -> Result<Vec<StoredFile>, CatalogError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CatalogError::Database(sqlx::Error::PoolTimedOut));
            }

            let mut rows = self.rows.lock();
            let inserted: Vec<StoredFile> = files
                .iter()
                .enumerate()
                .map(|(i, (file, hash))| StoredFile {
                    id: (rows.len() + i) as i64 + 1,
                    name: file.name.clone(),
                    path: file.path.clone(),
                    path_hash: *hash,
                    size: file.size,
                    content_type: file.content_type.clone(),
                    created_by: file.created_by,
                    created_at: Utc::now(),
                })
                .collect();
            rows.extend(inserted.iter().cloned());
            Ok(inserted)
        }

        async fn find_files(&self, _ids: &[i64]) -> Result<Vec<StoredFile>, CatalogError> {
            Ok(Vec::new())
        }

        async fn delete_files(&self, _ids: &[i64]) -> Result<u64, CatalogError> {
            Ok(0)
        }
    }

    struct NullStore;

    #[async_trait]
    impl ObjectStore for NullStore {
        async fn ensure_bucket(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn put_file(&self, _key: &str, _path: &Path, _ct: &str) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete_prefix(&self, _prefix: &str) -> Result<DeleteReport, StoreError> {
            Ok(DeleteReport::default())
        }

        async fn presign_get(&self, key: &str, _ct: Option<&str>) -> Result<String, StoreError> {
            Ok(key.to_string())
        }

        async fn presign_put(&self, key: &str) -> Result<PresignedUpload, StoreError> {
            Ok(PresignedUpload {
                upload_url: key.to_string(),
                access_url: key.to_string(),
            })
        }
    }

    fn catalog(registry: Arc<FlakyRegistry>, dedup: Arc<BoundedDedup>) -> FileCatalog {
        FileCatalog::new(
            registry,
            Arc::new(NullStore),
            dedup,
            UrlRewriter::new(&crate::config::UrlRewriteConfig::default()),
        )
    }

    fn perception_record() -> NewFile {
        NewFile {
            name: "scene_ROS_PERCEPTION_DATA_0001.json".to_string(),
            path: "1/scene/ROS_PERCEPTION_DATA_0001.json".to_string(),
            size: 10,
            content_type: "application/json".to_string(),
            created_by: 1,
        }
    }

    #[tokio::test]
    async fn test_register_dedups_through_bounded_set() {
        let registry = Arc::new(FlakyRegistry::default());
        let dedup = Arc::new(BoundedDedup::new(16));
        let catalog = catalog(registry.clone(), dedup.clone());

        assert_eq!(catalog.register(vec![perception_record()]).await.unwrap().len(), 1);
        assert!(catalog.register(vec![perception_record()]).await.unwrap().is_empty());
        assert!(dedup.contains(path_hash(&perception_record().path)));
        assert_eq!(registry.rows.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_insert_does_not_mark_record_as_ingested() {
        let registry = Arc::new(FlakyRegistry {
            failures: AtomicUsize::new(1),
            ..Default::default()
        });
        let dedup = Arc::new(BoundedDedup::new(16));
        let catalog = catalog(registry.clone(), dedup.clone());

        assert!(catalog.register(vec![perception_record()]).await.is_err());
        assert!(dedup.is_empty());

        let retried = catalog.register(vec![perception_record()]).await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(registry.rows.lock().len(), 1);
    }

    #[test]
    fn test_perception_record_detection() {
        assert!(is_perception_record("scene_ROS_PERCEPTION_DATA_001.json"));
        assert!(!is_perception_record("scene_ROS_PERCEPTION_DATA_001.pcd"));
        assert!(!is_perception_record("frame_001.json"));
    }

    #[test]
    fn test_path_hash_is_stable_and_distinct() {
        assert_eq!(path_hash("a/b.json"), path_hash("a/b.json"));
        assert_ne!(path_hash("a/b.json"), path_hash("a/c.json"));
    }
}
