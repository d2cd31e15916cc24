mod common;

use annotation_jobs::config::UrlRewriteConfig;
use annotation_jobs::fetcher::{AssetCategory, AssetDescriptor, RawAssetFetcher};
use annotation_jobs::object_store::UrlRewriter;
use common::spawn_asset_server;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn fetcher(concurrency: usize, rewrite: UrlRewriteConfig) -> RawAssetFetcher {
    RawAssetFetcher::new(concurrency, Some(Duration::from_secs(5)), UrlRewriter::new(&rewrite)).unwrap()
}

#[tokio::test]
async fn test_fetch_writes_assets_and_reports_failures() {
    let (base_url, _) = spawn_asset_server(Duration::ZERO).await;
    let dest = tempfile::tempdir().unwrap();
    let assets = vec![
        AssetDescriptor::new(
            format!("{base_url}/assets/a.pcd"),
            AssetCategory::LidarPointCloud,
            "a.pcd",
        ),
        AssetDescriptor::new(
            format!("{base_url}/assets/b.jpg"),
            AssetCategory::CameraImage { index: Some(0) },
            "b.jpg",
        ),
        AssetDescriptor::new(
            format!("{base_url}/assets/missing.json"),
            AssetCategory::CameraConfig,
            "c.json",
        ),
    ];

    let report = fetcher(10, UrlRewriteConfig::default())
        .fetch_all(assets, dest.path())
        .await
        .unwrap();

    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].url.ends_with("missing.json"));

    let pcd = std::fs::read_to_string(dest.path().join("lidar_point_cloud/a.pcd")).unwrap();
    assert_eq!(pcd, "content-of-a.pcd");
    assert!(dest.path().join("camera_image_0/b.jpg").exists());
    assert!(!dest.path().join("camera_config/c.json").exists());
}

#[tokio::test]
async fn test_concurrency_never_exceeds_pool_size() {
    let (base_url, peak) = spawn_asset_server(Duration::from_millis(50)).await;
    let dest = tempfile::tempdir().unwrap();
    let assets = (0..12)
        .map(|i| {
            AssetDescriptor::new(
                format!("{base_url}/assets/{i}.pcd"),
                AssetCategory::LidarPointCloud,
                format!("{i}.pcd"),
            )
        })
        .collect();

    let report = fetcher(3, UrlRewriteConfig::default())
        .fetch_all(assets, dest.path())
        .await
        .unwrap();

    assert_eq!(report.succeeded.len(), 12);
    assert!(report.is_complete());
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency was {peak}");
    assert!(peak >= 1);
}

#[tokio::test]
async fn test_public_urls_are_fetched_through_internal_endpoint() {
    let (base_url, _) = spawn_asset_server(Duration::ZERO).await;
    let dest = tempfile::tempdir().unwrap();
    let rewrite = UrlRewriteConfig {
        internal_endpoint: base_url.clone(),
        public_prefixes: vec!["https://public.example.com/minio".to_string()],
        external_path_prefix: "minio".to_string(),
    };
    let assets = vec![AssetDescriptor::new(
        "https://public.example.com/minio/assets/remote.pcd",
        AssetCategory::LidarPointCloud,
        "remote.pcd",
    )];

    let report = fetcher(10, rewrite).fetch_all(assets, dest.path()).await.unwrap();

    assert!(report.is_complete());
    let body = std::fs::read_to_string(dest.path().join("lidar_point_cloud/remote.pcd")).unwrap();
    assert_eq!(body, "content-of-remote.pcd");
}

#[tokio::test]
async fn test_empty_asset_list_returns_immediately() {
    let dest = tempfile::tempdir().unwrap();

    let report = fetcher(10, UrlRewriteConfig::default())
        .fetch_all(Vec::new(), dest.path())
        .await
        .unwrap();

    assert!(report.succeeded.is_empty());
    assert!(report.is_complete());
}

#[tokio::test]
async fn test_interrupted_download_leaves_no_partial_file() {
    let (base_url, _) = spawn_asset_server(Duration::ZERO).await;
    let dest = tempfile::tempdir().unwrap();
    let assets = vec![AssetDescriptor::new(
        format!("{base_url}/assets/truncated.pcd"),
        AssetCategory::LidarPointCloud,
        "frame.pcd",
    )];

    let report = fetcher(10, UrlRewriteConfig::default())
        .fetch_all(assets, dest.path())
        .await
        .unwrap();

    assert!(report.succeeded.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert!(!dest.path().join("lidar_point_cloud/frame.pcd").exists());
}
