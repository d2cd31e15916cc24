use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::archive::ArchiveFormat;

/// Main configuration for the job service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Export pipeline configuration
    #[serde(default)]
    pub export: ExportConfig,
    /// Presigned URL rewriting
    #[serde(default)]
    pub url_rewrite: UrlRewriteConfig,
    /// Inference service configuration
    pub inference: InferenceConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying model job messages
    #[serde(default = "default_job_topic")]
    pub job_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding dataset files and export archives
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Presigned URL expiration in seconds (7 days default)
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (20MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (20MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Export pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Root under which per-run staging directories are created
    #[serde(default = "default_temp_path")]
    pub temp_path: PathBuf,
    /// Number of record ids materialized per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Worker pool size for raw asset downloads
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    /// Archive container written before upload
    #[serde(default)]
    pub archive_format: ArchiveFormat,
    /// Per-request download timeout; unset means no timeout
    pub download_timeout_secs: Option<u64>,
    /// Capacity of the perception record dedup set
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

/// Rewriting of presigned URLs between internal and public hosts
#[derive(Debug, Clone, Deserialize)]
pub struct UrlRewriteConfig {
    /// Endpoint the service itself uses to reach the object store
    #[serde(default = "default_internal_endpoint")]
    pub internal_endpoint: String,
    /// Public URL prefixes that are mapped back to the internal endpoint
    #[serde(default)]
    pub public_prefixes: Vec<String>,
    /// Path segment under which the proxy exposes the object store
    #[serde(default = "default_external_path_prefix")]
    pub external_path_prefix: String,
}

/// Inference service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Base URL of the point cloud detection service
    pub endpoint: String,
    /// Request timeout in seconds
    #[serde(default = "default_inference_timeout_secs")]
    pub timeout_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "annotation-jobs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_consumer_group() -> String {
    "dataset-model-job".to_string()
}

fn default_job_topic() -> String {
    "dataset.model.jobs".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    600000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_multipart_threshold() -> usize {
    20 * 1024 * 1024 // 20MB
}

fn default_part_size() -> usize {
    20 * 1024 * 1024 // 20MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_temp_path() -> PathBuf {
    std::env::temp_dir().join("annotation-jobs")
}

fn default_batch_size() -> usize {
    1000
}

fn default_fetch_concurrency() -> usize {
    10
}

fn default_dedup_capacity() -> usize {
    1_000_000
}

fn default_internal_endpoint() -> String {
    "http://minio:9000".to_string()
}

fn default_external_path_prefix() -> String {
    "minio".to_string()
}

fn default_inference_timeout_secs() -> u64 {
    120
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "annotation-jobs")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/jobs").required(false))
            .add_source(config::File::with_name("/etc/annotation-jobs/jobs").required(false))
            // JOBS__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("JOBS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }

    /// Get inference request timeout as Duration
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference.timeout_secs)
    }
}

impl ExportConfig {
    /// Get the optional per-download timeout as Duration
    pub fn download_timeout(&self) -> Option<Duration> {
        self.download_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            temp_path: default_temp_path(),
            batch_size: default_batch_size(),
            fetch_concurrency: default_fetch_concurrency(),
            archive_format: ArchiveFormat::default(),
            download_timeout_secs: None,
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

impl Default for UrlRewriteConfig {
    fn default() -> Self {
        Self {
            internal_endpoint: default_internal_endpoint(),
            public_prefixes: Vec::new(),
            external_path_prefix: default_external_path_prefix(),
        }
    }
}
