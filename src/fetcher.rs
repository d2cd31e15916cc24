//! Bounded-concurrency download of raw assets into a staging directory.

use crate::object_store::UrlRewriter;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build download client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("asset fetch interrupted: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

/// Failure of a single asset, reported but never fatal to the run
#[derive(Debug, Error)]
enum AssetError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid asset filename {0:?}")]
    InvalidFilename(String),

    #[error("download pool closed")]
    PoolClosed,
}

/// Directory category an asset is staged under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetCategory {
    LidarPointCloud,
    /// Camera image, numbered when the source names its camera
    CameraImage { index: Option<u32> },
    CameraConfig,
}

fn camera_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"camera_image_(\d+)").ok())
        .as_ref()
}

impl AssetCategory {
    /// Camera category from the image's source zip path, e.g. `.../camera_image_2/0001.jpg`
    pub fn camera_from_zip_path(zip_path: &str) -> Self {
        let index = camera_pattern()
            .and_then(|pattern| pattern.captures(zip_path))
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok());
        AssetCategory::CameraImage { index }
    }

    pub fn dir_name(&self) -> String {
        match self {
            AssetCategory::LidarPointCloud => "lidar_point_cloud".to_string(),
            AssetCategory::CameraImage { index: Some(n) } => format!("camera_image_{n}"),
            AssetCategory::CameraImage { index: None } => "camera_image".to_string(),
            AssetCategory::CameraConfig => "camera_config".to_string(),
        }
    }
}

/// One asset to download
#[derive(Debug, Clone, PartialEq)]
pub struct AssetDescriptor {
    pub url: String,
    pub category: AssetCategory,
    pub filename: String,
}

impl AssetDescriptor {
    pub fn new(url: impl Into<String>, category: AssetCategory, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            category,
            filename: filename.into(),
        }
    }

    /// Deterministic target `<dest>/<category>/<filename>`
    fn target(&self, dest: &Path) -> Result<PathBuf, AssetError> {
        let name = Path::new(&self.filename)
            .file_name()
            .ok_or_else(|| AssetError::InvalidFilename(self.filename.clone()))?;
        Ok(dest.join(self.category.dir_name()).join(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAsset {
    pub url: String,
    pub reason: String,
}

/// What a fetch run staged and what it could not
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<FailedAsset>,
}

impl FetchReport {
    pub fn merge(&mut self, other: FetchReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Downloads assets through a worker pool shared by every caller
pub struct RawAssetFetcher {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    rewriter: UrlRewriter,
}

impl RawAssetFetcher {
    pub fn new(
        concurrency: usize,
        timeout: Option<Duration>,
        rewriter: UrlRewriter,
    ) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            rewriter,
        })
    }

    /// Fetch every asset into `dest`, waiting until all have finished.
    ///
    /// Per-asset failures land in the report. Only a crashed worker is an error.
    #[instrument(skip(self, assets), fields(count = assets.len(), dest = %dest.display()))]
    pub async fn fetch_all(
        &self,
        assets: Vec<AssetDescriptor>,
        dest: &Path,
    ) -> Result<FetchReport, FetchError> {
        let mut workers = JoinSet::new();

        for asset in assets {
            let client = self.client.clone();
            let permits = self.permits.clone();
            let url = self.rewriter.to_internal(&asset.url);
            let target = asset.target(dest);

            workers.spawn(async move {
                let result = match target {
                    Ok(target) => match permits.acquire_owned().await {
                        Ok(_permit) => download(&client, &url, &target).await.map(|_| target),
                        Err(_) => Err(AssetError::PoolClosed),
                    },
                    Err(e) => Err(e),
                };
                (asset.url, result)
            });
        }

        let mut report = FetchReport::default();
        while let Some(joined) = workers.join_next().await {
            let (url, result) = joined?;
            match result {
                Ok(path) => report.succeeded.push(path),
                Err(e) => {
                    warn!(url = %url, error = %e, "Asset download failed");
                    metrics::counter!("export.assets.failed").increment(1);
                    report.failed.push(FailedAsset {
                        url,
                        reason: e.to_string(),
                    });
                }
            }
        }

        debug!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Asset fetch finished"
        );
        Ok(report)
    }
}

/// Download `url` to `target`. A partially written file is removed on failure.
async fn download(client: &reqwest::Client, url: &str, target: &Path) -> Result<(), AssetError> {
    let response = client.get(url).send().await?.error_for_status()?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(target).await?;

    if let Err(e) = write_body(response, file).await {
        match tokio::fs::remove_file(target).await {
            Ok(()) => debug!(path = %target.display(), "Removed partial download"),
            Err(remove) => warn!(path = %target.display(), error = %remove, "Failed to remove partial download"),
        }
        return Err(e);
    }
    Ok(())
}

async fn write_body(
    mut response: reqwest::Response,
    mut file: tokio::fs::File,
) -> Result<(), AssetError> {
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}
