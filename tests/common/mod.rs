#![allow(dead_code)]

use annotation_jobs::archive::{ArchiveError, Archiver, StagingConverter, TarArchiver};
use annotation_jobs::config::{ExportConfig, UrlRewriteConfig};
use annotation_jobs::dedup::BoundedDedup;
use annotation_jobs::export_pipeline::{
    DataKind, ExportData, ExportPayload, ExportPipeline, ExportResult, ExportSource, RawAsset,
};
use annotation_jobs::export_record::{ExportRecord, ExportRecordStore, ExportStatus, RecordError};
use annotation_jobs::fetcher::RawAssetFetcher;
use annotation_jobs::file_catalog::{CatalogError, FileCatalog, FileRegistry, NewFile, StoredFile};
use annotation_jobs::object_store::{DeleteReport, ObjectStore, PresignedUpload, StoreError, UrlRewriter};
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::Path as UrlPath;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Object store keeping uploads in memory
#[derive(Default)]
pub struct MemoryObjectStore {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_uploads: bool,
}

impl MemoryObjectStore {
    pub fn failing() -> Self {
        Self {
            fail_uploads: true,
            ..Default::default()
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn ensure_bucket(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path, _content_type: &str) -> Result<u64, StoreError> {
        if self.fail_uploads {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "store unavailable",
            )));
        }
        let bytes = tokio::fs::read(path).await?;
        let size = bytes.len() as u64;
        self.objects.lock().insert(key.to_string(), bytes);
        Ok(size)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.lock().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<DeleteReport, StoreError> {
        let mut objects = self.objects.lock();
        let before = objects.len();
        objects.retain(|key, _| !key.starts_with(prefix));
        Ok(DeleteReport {
            deleted: before - objects.len(),
            failed: 0,
        })
    }

    async fn presign_get(
        &self,
        key: &str,
        response_content_type: Option<&str>,
    ) -> Result<String, StoreError> {
        let mut url = format!("http://minio:9000/bucket/{key}?X-Amz-Signature=test");
        if let Some(content_type) = response_content_type {
            url.push_str(&format!("&response-content-type={content_type}"));
        }
        Ok(url)
    }

    async fn presign_put(&self, key: &str) -> Result<PresignedUpload, StoreError> {
        Ok(PresignedUpload {
            upload_url: format!("http://minio:9000/bucket/{key}?X-Amz-Signature=put"),
            access_url: self.presign_get(key, None).await?,
        })
    }
}

/// Record store keeping every written snapshot
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<Uuid, ExportRecord>>,
    history: Mutex<Vec<ExportRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, serial: Uuid) -> Option<ExportRecord> {
        self.records.lock().get(&serial).cloned()
    }

    /// Snapshots of one record in write order
    pub fn history(&self, serial: Uuid) -> Vec<ExportRecord> {
        self.history
            .lock()
            .iter()
            .filter(|record| record.serial_number == serial)
            .cloned()
            .collect()
    }

    fn update<F>(&self, serial: Uuid, next: ExportStatus, apply: F) -> Result<(), RecordError>
    where
        F: FnOnce(&mut ExportRecord),
    {
        let mut records = self.records.lock();
        let record = records.get_mut(&serial).ok_or(RecordError::NotFound(serial))?;
        record.ensure_transition(next)?;

        apply(record);
        record.status = next;
        record.updated_at = chrono::Utc::now();
        self.history.lock().push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl ExportRecordStore for MemoryRecordStore {
    async fn insert(&self, record: &ExportRecord) -> Result<(), RecordError> {
        self.records.lock().insert(record.serial_number, record.clone());
        self.history.lock().push(record.clone());
        Ok(())
    }

    async fn update_progress(
        &self,
        serial: Uuid,
        generated_num: i64,
        total_num: i64,
    ) -> Result<(), RecordError> {
        self.update(serial, ExportStatus::Generating, |record| {
            record.generated_num = generated_num;
            record.total_num = total_num;
        })
    }

    async fn mark_completed(
        &self,
        serial: Uuid,
        file_id: i64,
        failed_asset_num: i64,
    ) -> Result<(), RecordError> {
        self.update(serial, ExportStatus::Completed, |record| {
            record.file_id = Some(file_id);
            record.failed_asset_num = failed_asset_num;
        })
    }

    async fn mark_failed(&self, serial: Uuid, failed_asset_num: i64) -> Result<(), RecordError> {
        self.update(serial, ExportStatus::Failed, |record| {
            record.failed_asset_num = failed_asset_num;
        })
    }

    async fn find_by_serials(&self, serials: &[Uuid]) -> Result<Vec<ExportRecord>, RecordError> {
        let records = self.records.lock();
        Ok(serials
            .iter()
            .filter_map(|serial| records.get(serial).cloned())
            .collect())
    }
}

/// File registry with sequence-style ids that are never reused
#[derive(Default)]
pub struct MemoryFileRegistry {
    files: Mutex<Vec<StoredFile>>,
    last_id: AtomicI64,
}

impl MemoryFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<StoredFile> {
        self.files.lock().clone()
    }
}

#[async_trait]
impl FileRegistry for MemoryFileRegistry {
    async fn insert_files(
        &self,
        files: &[(NewFile, i64)],
    ) -> Result<Vec<StoredFile>, CatalogError> {
        let inserted: Vec<StoredFile> = files
            .iter()
            .map(|(file, hash)| StoredFile {
                id: self.last_id.fetch_add(1, Ordering::SeqCst) + 1,
                name: file.name.clone(),
                path: file.path.clone(),
                path_hash: *hash,
                size: file.size,
                content_type: file.content_type.clone(),
                created_by: file.created_by,
                created_at: chrono::Utc::now(),
            })
            .collect();

        self.files.lock().extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn find_files(&self, ids: &[i64]) -> Result<Vec<StoredFile>, CatalogError> {
        Ok(self
            .files
            .lock()
            .iter()
            .filter(|file| ids.contains(&file.id))
            .cloned()
            .collect())
    }

    async fn delete_files(&self, ids: &[i64]) -> Result<u64, CatalogError> {
        let mut files = self.files.lock();
        let before = files.len();
        files.retain(|file| !ids.contains(&file.id));
        Ok((before - files.len()) as u64)
    }
}

/// Export source over a fixed id range, recording requested batch sizes
pub struct StaticSource {
    pub ids: Vec<i64>,
    pub kind: DataKind,
    pub assets: Vec<RawAsset>,
    pub scene_name: String,
    /// Name given to every record instead of `data-<id>`
    pub record_name: Option<String>,
    pub batches: Mutex<Vec<usize>>,
}

impl StaticSource {
    pub fn new(count: usize) -> Self {
        Self {
            ids: (1..=count as i64).collect(),
            kind: DataKind::LidarBasic,
            assets: Vec::new(),
            scene_name: "scene-1".to_string(),
            record_name: None,
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_names(mut self, scene_name: impl Into<String>, record_name: impl Into<String>) -> Self {
        self.scene_name = scene_name.into();
        self.record_name = Some(record_name.into());
        self
    }

    pub fn with_assets(mut self, assets: Vec<RawAsset>) -> Self {
        self.kind = DataKind::LidarFusion;
        self.assets = assets;
        self
    }
}

#[async_trait]
impl ExportSource for StaticSource {
    async fn resolve_ids(&self) -> anyhow::Result<Vec<i64>> {
        Ok(self.ids.clone())
    }

    async fn load_batch(&self, ids: &[i64]) -> anyhow::Result<Vec<ExportPayload>> {
        self.batches.lock().push(ids.len());

        Ok(ids
            .iter()
            .map(|id| ExportPayload {
                scene_name: Some(self.scene_name.clone()),
                data: ExportData {
                    id: *id,
                    name: self
                        .record_name
                        .clone()
                        .unwrap_or_else(|| format!("data-{id}")),
                    kind: self.kind,
                    assets: self.assets.clone(),
                },
                results: vec![ExportResult {
                    source_name: Some("model-a".to_string()),
                    body: serde_json::json!({"dataId": id, "objects": []})
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                }],
            })
            .collect())
    }
}

pub struct FailingArchiver;

#[async_trait]
impl Archiver for FailingArchiver {
    fn extension(&self) -> &str {
        "tar"
    }

    fn content_type(&self) -> &str {
        "application/x-tar"
    }

    async fn archive(&self, _source_dir: &Path, dest: &Path) -> Result<(), ArchiveError> {
        // Leave a partial file behind, as a crashed writer would
        std::fs::write(dest, b"partial").map_err(|source| ArchiveError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        Err(ArchiveError::Io {
            path: dest.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        })
    }
}

pub struct FailingConverter;

#[async_trait]
impl StagingConverter for FailingConverter {
    async fn convert(&self, _staging_dir: &Path) -> Result<(), ArchiveError> {
        Err(ArchiveError::Conversion("unsupported point format".to_string()))
    }
}

pub struct Harness {
    pub temp: tempfile::TempDir,
    pub records: Arc<MemoryRecordStore>,
    pub registry: Arc<MemoryFileRegistry>,
    pub store: Arc<MemoryObjectStore>,
    pub pipeline: ExportPipeline,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(MemoryObjectStore::default(), Arc::new(TarArchiver::default()), 1000)
    }

    pub fn build(store: MemoryObjectStore, archiver: Arc<dyn Archiver>, batch_size: usize) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let config = ExportConfig {
            temp_path: temp.path().to_path_buf(),
            batch_size,
            ..Default::default()
        };
        let records = Arc::new(MemoryRecordStore::new());
        let registry = Arc::new(MemoryFileRegistry::new());
        let store = Arc::new(store);
        let rewriter = UrlRewriter::new(&UrlRewriteConfig::default());
        let catalog = Arc::new(FileCatalog::new(
            registry.clone(),
            store.clone(),
            Arc::new(BoundedDedup::new(100)),
            rewriter.clone(),
        ));
        let fetcher = Arc::new(
            RawAssetFetcher::new(config.fetch_concurrency, Some(Duration::from_secs(5)), rewriter)
                .unwrap(),
        );

        let pipeline = ExportPipeline::new(
            &config,
            records.clone(),
            catalog,
            store.clone(),
            fetcher,
            archiver,
        );

        Self {
            temp,
            records,
            registry,
            store,
            pipeline,
        }
    }

    /// Entries left under the staging root
    pub fn staging_entries(&self) -> usize {
        std::fs::read_dir(self.temp.path()).unwrap().count()
    }
}

/// Serves `/assets/<name>`: names starting with `missing` are 404, names starting with
/// `truncated` fail mid-body, others echo their name.
/// Returns the base URL and the peak number of concurrent requests seen.
pub async fn spawn_asset_server(delay: Duration) -> (String, Arc<AtomicUsize>) {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let app = Router::new().route(
        "/assets/:name",
        get({
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            move |UrlPath(name): UrlPath<String>| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);

                    if name.starts_with("missing") {
                        StatusCode::NOT_FOUND.into_response()
                    } else if name.starts_with("truncated") {
                        // The connection drops after the first chunk
                        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                            Ok(Bytes::from_static(b"partial-")),
                            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "upstream reset")),
                        ];
                        Body::from_stream(futures::stream::iter(chunks)).into_response()
                    } else {
                        format!("content-of-{name}").into_response()
                    }
                }
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), peak)
}

pub fn tar_entries(bytes: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(bytes);
    archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}
