//! Dataset export: resolve, materialize in batches, archive, upload, finalize.
//!
//! ```text
//! resolve ids ──▶ batches of N ──▶ result files + staged assets
//!                      │ progress per batch
//!                      ▼
//!              convert? ──▶ archive ──▶ upload ──▶ register file ──▶ COMPLETED
//!                 any failure ──────────────────────────────────────▶ FAILED
//! ```
//!
//! The staging directory and the archive live under one per-run directory that
//! is removed when the run ends, whichever way it ends.

use crate::archive::{ArchiveError, Archiver, StagingConverter, TarArchiver};
use crate::config::{ExportConfig, UrlRewriteConfig};
use crate::dedup::BoundedDedup;
use crate::export_record::{create_export_record, ExportRecord, ExportRecordStore, ExportStatus, RecordError};
use crate::fetcher::{AssetCategory, AssetDescriptor, FetchError, FetchReport, RawAssetFetcher};
use crate::file_catalog::{CatalogError, FileCatalog, FileRegistry, NewFile};
use crate::object_store::{ObjectStore, StoreError, UrlRewriter};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Directory used for results without a usable source or scene name
pub const UNKNOWN_SOURCE: &str = "UNKNOWN";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export query resolved to no data")]
    NoData,

    #[error("export cancelled")]
    Cancelled,

    #[error("export file name {0:?} is not a plain file name")]
    InvalidFileName(String),

    #[error("export source failed: {0}")]
    Source(#[source] anyhow::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("upload failed: {0}")]
    Upload(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("archive was not registered")]
    NotRegistered,

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Kind of a data record, deciding which assets it stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataKind {
    LidarFusion,
    LidarBasic,
    Image,
}

impl DataKind {
    pub fn stages_assets(&self) -> bool {
        matches!(self, DataKind::LidarFusion)
    }
}

/// Role of a raw asset referenced by a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetRole {
    PointCloud,
    Image,
    CameraConfig,
}

/// Raw asset reference as returned by the export source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAsset {
    pub role: AssetRole,
    pub url: String,
    pub filename: String,
    /// Path of the asset inside its original upload, used to number cameras
    #[serde(default)]
    pub zip_path: Option<String>,
}

impl RawAsset {
    fn descriptor(&self) -> AssetDescriptor {
        let category = match self.role {
            AssetRole::PointCloud => AssetCategory::LidarPointCloud,
            AssetRole::Image => {
                AssetCategory::camera_from_zip_path(self.zip_path.as_deref().unwrap_or_default())
            }
            AssetRole::CameraConfig => AssetCategory::CameraConfig,
        };
        AssetDescriptor::new(self.url.clone(), category, self.filename.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportData {
    pub id: i64,
    pub name: String,
    pub kind: DataKind,
    #[serde(default)]
    pub assets: Vec<RawAsset>,
}

/// One annotation result for a record, from one result source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

/// Everything needed to materialize one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPayload {
    #[serde(default)]
    pub scene_name: Option<String>,
    pub data: ExportData,
    #[serde(default)]
    pub results: Vec<ExportResult>,
}

/// Caller-supplied query: id resolution and batch materialization
#[async_trait]
pub trait ExportSource: Send + Sync {
    async fn resolve_ids(&self) -> anyhow::Result<Vec<i64>>;

    async fn load_batch(&self, ids: &[i64]) -> anyhow::Result<Vec<ExportPayload>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    /// Archive base name, without extension
    pub file_name: String,
    pub created_by: i64,
    pub dataset_id: Option<i64>,
}

/// Per-run working directory. Removed explicitly when a run ends, with drop
/// as the fallback for unwinding or abandoned runs.
struct StagingArea {
    root: PathBuf,
    removed: bool,
}

impl StagingArea {
    async fn create(temp_path: &Path, serial: &uuid::Uuid) -> Result<Self, ExportError> {
        let root = temp_path.join(serial.to_string());
        let src = root.join("src");
        tokio::fs::create_dir_all(&src)
            .await
            .map_err(|source| ExportError::Write {
                path: src.clone(),
                source,
            })?;
        Ok(Self {
            root,
            removed: false,
        })
    }

    fn src_dir(&self) -> PathBuf {
        self.root.join("src")
    }

    fn archive_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    async fn remove(mut self) {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!(path = %self.root.display(), "Staging area removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            // Drop retries
            Err(e) => {
                warn!(path = %self.root.display(), error = %e, "Failed to remove staging area");
                return;
            }
        }
        self.removed = true;
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => debug!(path = %self.root.display(), "Staging area removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.root.display(), error = %e, "Failed to remove staging area"),
        }
    }
}

/// `name` if it is exactly one normal path component, so joining it can
/// neither replace nor climb out of the parent directory
pub fn path_segment(name: &str) -> Option<&str> {
    let name = name.trim();
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(name),
        _ => None,
    }
}

/// Split ids into consecutive batches of at most `batch_size`
pub fn partition(ids: &[i64], batch_size: usize) -> std::slice::Chunks<'_, i64> {
    ids.chunks(batch_size.max(1))
}

/// Result file path `<base>/result/<source|UNKNOWN>/<record>.json`
pub fn result_path(base: &Path, source_name: Option<&str>, record_name: &str) -> PathBuf {
    let source = source_name.and_then(path_segment).unwrap_or(UNKNOWN_SOURCE);
    let record = path_segment(record_name).unwrap_or(UNKNOWN_SOURCE);
    base.join("result").join(source).join(format!("{record}.json"))
}

/// Directory a record is materialized under: the staging root, or its scene
fn scene_dir(src_dir: &Path, scene_name: Option<&str>) -> PathBuf {
    match scene_name.map(str::trim).filter(|scene| !scene.is_empty()) {
        None => src_dir.to_path_buf(),
        Some(scene) => match path_segment(scene) {
            Some(scene) => src_dir.join(scene),
            None => {
                warn!(scene, "Scene name is not a plain directory name, using {UNKNOWN_SOURCE}");
                src_dir.join(UNKNOWN_SOURCE)
            }
        },
    }
}

/// File stem for a record's result files; the record id when its name is unusable
fn record_stem(data: &ExportData) -> String {
    match path_segment(&data.name) {
        Some(name) => name.to_string(),
        None => {
            warn!(data_id = data.id, name = %data.name, "Record name is not a plain file name, using its id");
            data.id.to_string()
        }
    }
}

struct RunSummary {
    file_id: i64,
    failed_assets: usize,
}

pub struct ExportPipeline {
    records: Arc<dyn ExportRecordStore>,
    catalog: Arc<FileCatalog>,
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<RawAssetFetcher>,
    archiver: Arc<dyn Archiver>,
    converter: Option<Arc<dyn StagingConverter>>,
    temp_path: PathBuf,
    batch_size: usize,
}

impl ExportPipeline {
    pub fn new(
        config: &ExportConfig,
        records: Arc<dyn ExportRecordStore>,
        catalog: Arc<FileCatalog>,
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<RawAssetFetcher>,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        Self {
            records,
            catalog,
            store,
            fetcher,
            archiver,
            converter: None,
            temp_path: config.temp_path.clone(),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Wire a pipeline from configuration: a shared download pool of
    /// `fetch_concurrency`, the configured archive format and a dedup set of
    /// `dedup_capacity` in front of the file registry.
    pub fn from_config(
        export: &ExportConfig,
        url_rewrite: &UrlRewriteConfig,
        records: Arc<dyn ExportRecordStore>,
        registry: Arc<dyn FileRegistry>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, ExportError> {
        let rewriter = UrlRewriter::new(url_rewrite);
        let fetcher = RawAssetFetcher::new(
            export.fetch_concurrency,
            export.download_timeout(),
            rewriter.clone(),
        )?;
        let catalog = FileCatalog::new(
            registry,
            store.clone(),
            Arc::new(BoundedDedup::new(export.dedup_capacity)),
            rewriter,
        );

        Ok(Self::new(
            export,
            records,
            Arc::new(catalog),
            store,
            Arc::new(fetcher),
            Arc::new(TarArchiver::new(export.archive_format)),
        ))
    }

    pub fn catalog(&self) -> &Arc<FileCatalog> {
        &self.catalog
    }

    /// Remove staging areas left behind by runs that never finished, such as
    /// those of a crashed process. Only call while no run is in progress.
    pub async fn purge_stale_staging(&self) -> Result<usize, ExportError> {
        let io_err = |source| ExportError::Write {
            path: self.temp_path.clone(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(&self.temp_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let is_run_dir = entry
                .file_name()
                .to_str()
                .is_some_and(|name| uuid::Uuid::parse_str(name).is_ok());
            if !is_run_dir || !entry.file_type().await.map_err(io_err)?.is_dir() {
                continue;
            }

            tokio::fs::remove_dir_all(entry.path()).await.map_err(io_err)?;
            removed += 1;
        }

        if removed > 0 {
            info!(removed, path = %self.temp_path.display(), "Removed stale staging areas");
        }
        Ok(removed)
    }

    /// Run an extra conversion over the staged tree before archiving
    pub fn with_converter(mut self, converter: Arc<dyn StagingConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Create the GENERATING record for a new run
    pub async fn start(&self, request: &ExportRequest) -> Result<ExportRecord, ExportError> {
        let record = create_export_record(
            self.records.as_ref(),
            &request.file_name,
            request.created_by,
            request.dataset_id,
        )
        .await?;

        info!(serial = %record.serial_number, file_name = %record.file_name, "Export record created");
        Ok(record)
    }

    /// Create a record and run the export to its terminal status
    pub async fn export(
        &self,
        request: &ExportRequest,
        source: &dyn ExportSource,
        cancel: &CancellationToken,
    ) -> Result<ExportRecord, ExportError> {
        let record = self.start(request).await?;
        self.run(&record, source, cancel).await;

        self.records
            .find_by_serials(&[record.serial_number])
            .await?
            .into_iter()
            .next()
            .ok_or(ExportError::Record(RecordError::NotFound(record.serial_number)))
    }

    /// Drive a GENERATING record to COMPLETED or FAILED. Never returns an error;
    /// every failure ends as a FAILED record.
    #[instrument(skip(self, record, source, cancel), fields(serial = %record.serial_number))]
    pub async fn run(
        &self,
        record: &ExportRecord,
        source: &dyn ExportSource,
        cancel: &CancellationToken,
    ) -> ExportStatus {
        let mut failed_assets = 0;

        match self.execute(record, source, cancel, &mut failed_assets).await {
            Ok(summary) => {
                match self
                    .records
                    .mark_completed(record.serial_number, summary.file_id, summary.failed_assets as i64)
                    .await
                {
                    Ok(()) => {
                        metrics::counter!("export.runs.completed").increment(1);
                        info!(file_id = summary.file_id, failed_assets = summary.failed_assets, "Export completed");
                        return ExportStatus::Completed;
                    }
                    Err(e) => error!(error = %e, "Failed to persist export completion"),
                }
            }
            Err(e) => error!(error = %e, "Export failed"),
        }

        metrics::counter!("export.runs.failed").increment(1);
        if let Err(e) = self
            .records
            .mark_failed(record.serial_number, failed_assets as i64)
            .await
        {
            error!(error = %e, "Failed to persist export failure");
        }
        ExportStatus::Failed
    }

    async fn execute(
        &self,
        record: &ExportRecord,
        source: &dyn ExportSource,
        cancel: &CancellationToken,
        failed_assets: &mut usize,
    ) -> Result<RunSummary, ExportError> {
        let file_name = path_segment(&record.file_name)
            .ok_or_else(|| ExportError::InvalidFileName(record.file_name.clone()))?;
        let archive_name = format!("{}.{}", file_name, self.archiver.extension());

        let ids = source.resolve_ids().await.map_err(ExportError::Source)?;
        if ids.is_empty() {
            return Err(ExportError::NoData);
        }

        let staging = StagingArea::create(&self.temp_path, &record.serial_number).await?;
        let result = self
            .execute_staged(record, source, cancel, &ids, &staging, archive_name, failed_assets)
            .await;
        staging.remove().await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_staged(
        &self,
        record: &ExportRecord,
        source: &dyn ExportSource,
        cancel: &CancellationToken,
        ids: &[i64],
        staging: &StagingArea,
        archive_name: String,
        failed_assets: &mut usize,
    ) -> Result<RunSummary, ExportError> {
        let src_dir = staging.src_dir();
        let total = ids.len() as i64;
        let mut generated = 0i64;

        for (index, batch) in partition(ids, self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }

            let payloads = source.load_batch(batch).await.map_err(ExportError::Source)?;
            let report = self.materialize(&src_dir, &payloads).await?;
            if !report.is_complete() {
                warn!(batch = index, failed = report.failed.len(), "Some assets could not be staged");
            }
            *failed_assets += report.failed.len();

            generated += batch.len() as i64;
            self.records
                .update_progress(record.serial_number, generated, total)
                .await?;
            debug!(batch = index, generated, total, "Export batch materialized");
        }

        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        if let Some(converter) = &self.converter {
            converter.convert(&src_dir).await?;
        }

        let archive_path = staging.archive_path(&archive_name);
        let started = Instant::now();
        self.archiver.archive(&src_dir, &archive_path).await?;
        metrics::histogram!("export.archive.duration_seconds").record(started.elapsed().as_secs_f64());

        let key = format!(
            "{}/{}/{}",
            record.created_by,
            Utc::now().format("%Y%m%d%H%M%S"),
            archive_name
        );
        let size = self
            .store
            .put_file(&key, &archive_path, self.archiver.content_type())
            .await?;

        let stored = self
            .catalog
            .register(vec![NewFile {
                name: archive_name,
                path: key,
                size: size as i64,
                content_type: self.archiver.content_type().to_string(),
                created_by: record.created_by,
            }])
            .await?;
        let file_id = stored.first().map(|f| f.id).ok_or(ExportError::NotRegistered)?;

        Ok(RunSummary {
            file_id,
            failed_assets: *failed_assets,
        })
    }

    /// Write result files and stage assets for one batch
    async fn materialize(
        &self,
        src_dir: &Path,
        payloads: &[ExportPayload],
    ) -> Result<FetchReport, ExportError> {
        let mut pending: BTreeMap<PathBuf, Vec<AssetDescriptor>> = BTreeMap::new();

        for payload in payloads {
            let base = scene_dir(src_dir, payload.scene_name.as_deref());
            let stem = record_stem(&payload.data);

            for result in &payload.results {
                let path = result_path(&base, result.source_name.as_deref(), &stem);
                write_json(&path, result).await?;
            }

            if payload.data.kind.stages_assets() && !payload.data.assets.is_empty() {
                pending
                    .entry(base.join("data"))
                    .or_default()
                    .extend(payload.data.assets.iter().map(RawAsset::descriptor));
            }
        }

        let mut report = FetchReport::default();
        for (dest, assets) in pending {
            report.merge(self.fetcher.fetch_all(assets, &dest).await?);
        }
        Ok(report)
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ExportError> {
    let io_err = |source| ExportError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let bytes = serde_json::to_vec(value)?;
    tokio::fs::write(path, bytes).await.map_err(io_err)
}
