//! Annotation Jobs Service
//!
//! Asynchronous job processing for the point cloud annotation platform. The
//! service consumes model job messages from Kafka, dispatches them to
//! per-model handlers that run inference and normalize the detections, and
//! provides the dataset export pipeline that packages annotated records into
//! downloadable archives.
//!
//! ## Features
//!
//! - **At-least-once job handling**: offsets are committed only after a
//!   handler reports success; everything else is redelivered by Kafka
//! - **Result normalization**: legacy and extended detection payloads are
//!   mapped onto one canonical detection shape with confidence filtering
//! - **Batched exports**: ids are materialized in batches with progress
//!   persisted after each one, raw assets are fetched by a bounded pool
//! - **Guaranteed cleanup**: the staging area of a run is removed on every
//!   exit path
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topic               Handlers                  PostgreSQL
//! ┌──────────────┐         ┌──────────────┐          ┌──────────────┐
//! │ Model Jobs   │────────▶│ Registry     │          │ model_results│
//! └──────────────┘         │   ▼          │─────────▶│ export_records
//!                          │ Normalizer   │          │ files        │
//!                          └──────────────┘          └──────────────┘
//!                                                           ▲
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐    │
//! │ Export       │──▶│ Asset        │──▶│ Archiver     │    │
//! │ Pipeline     │   │ Fetcher      │   └──────────────┘    │
//! └──────────────┘   └──────────────┘          │            │
//!        │                                     ▼            │
//!        │                              ┌──────────────┐    │
//!        └─────────────────────────────▶│ Object Store │────┘
//!                                       └──────────────┘
//! ```

pub mod archive;
pub mod config;
pub mod consumer;
pub mod dedup;
pub mod export_pipeline;
pub mod export_record;
pub mod fetcher;
pub mod file_catalog;
pub mod handler;
pub mod message;
pub mod metadata_store;
pub mod normalizer;
pub mod object_store;

pub use archive::{ArchiveFormat, Archiver, StagingConverter, TarArchiver};
pub use config::Config;
pub use consumer::{
    Acknowledger, CommitTracker, DeliveryId, DispatchOutcome, JobDispatcher, JobStreamConsumer,
    TrackedAcknowledger,
};
pub use dedup::{BoundedDedup, DedupGuard};
pub use export_pipeline::{ExportPayload, ExportPipeline, ExportRequest, ExportSource};
pub use export_record::{ExportRecord, ExportRecordStore, ExportStatus};
pub use fetcher::{AssetCategory, AssetDescriptor, FetchReport, RawAssetFetcher};
pub use file_catalog::{FileCatalog, FileRegistry, NewFile, StoredFile};
pub use handler::{HandlerRegistry, ModelMessageHandler, PointCloudDetectionHandler};
pub use message::{DeliveryUnit, JobMessage, ModelCode, UserContext};
pub use metadata_store::PgMetadataStore;
pub use normalizer::{normalize_batch, normalize_single, DetectionBatchOutcome, DetectionResult};
pub use object_store::{ObjectStore, S3ObjectStore, UrlRewriter};
