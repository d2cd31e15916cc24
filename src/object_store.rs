use crate::config::{S3Config, UrlRewriteConfig};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

/// Errors raised by object store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store {operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },

    #[error("failed to read local file for upload: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid presign configuration: {0}")]
    Presign(String),
}

impl StoreError {
    fn request<E: std::error::Error>(operation: &'static str, err: E) -> Self {
        StoreError::Request {
            operation,
            message: DisplayErrorContext(err).to_string(),
        }
    }
}

/// Presigned upload target plus the URL the object can be read back from
#[derive(Debug, Clone, PartialEq)]
pub struct PresignedUpload {
    pub upload_url: String,
    pub access_url: String,
}

/// Outcome of a prefix delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Content store holding dataset files and export archives
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket if it does not exist yet
    async fn ensure_bucket(&self) -> Result<(), StoreError>;

    /// Upload a local file, returning its size in bytes
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete every object under `prefix`
    async fn delete_prefix(&self, prefix: &str) -> Result<DeleteReport, StoreError>;

    /// Presigned GET, optionally overriding the response content type
    async fn presign_get(
        &self,
        key: &str,
        response_content_type: Option<&str>,
    ) -> Result<String, StoreError>;

    async fn presign_put(&self, key: &str) -> Result<PresignedUpload, StoreError>;
}

/// S3-compatible object store (AWS S3, MinIO)
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    pub async fn new(config: &S3Config) -> Result<Self, StoreError> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // MinIO needs path-style addressing
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "Object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    fn presigning_config(&self) -> Result<PresigningConfig, StoreError> {
        PresigningConfig::expires_in(Duration::from_secs(self.config.presigned_url_expiry_secs))
            .map_err(|e| StoreError::Presign(e.to_string()))
    }

    async fn simple_upload(&self, key: &str, path: &Path, content_type: &str) -> Result<(), StoreError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StoreError::request("read body", e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StoreError::request("put_object", e))?;

        Ok(())
    }

    async fn multipart_upload(&self, key: &str, path: &Path, content_type: &str) -> Result<(), StoreError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StoreError::request("create_multipart_upload", e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StoreError::Request {
                operation: "create_multipart_upload",
                message: "no upload id in response".to_string(),
            })?
            .to_string();

        match self.upload_parts(key, path, &upload_id).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| StoreError::request("complete_multipart_upload", e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %DisplayErrorContext(abort_err), "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        path: &Path,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, StoreError> {
        let mut file = tokio::fs::File::open(path).await?;
        let part_size = self.config.part_size_bytes.max(1);
        let mut parts = Vec::new();
        let mut part_number = 1;

        loop {
            let chunk = read_part(&mut file, part_size).await?;
            if chunk.is_empty() {
                break;
            }

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| StoreError::request("upload_part", e))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
        }

        Ok(parts)
    }
}

/// Fill up to `part_size` bytes; a short read only happens at end of file
async fn read_part(file: &mut tokio::fs::File, part_size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; part_size];
    let mut filled = 0;
    while filled < part_size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn ensure_bucket(&self) -> Result<(), StoreError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().is_some_and(|e| e.is_not_found()) => {
                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .map_err(|e| StoreError::request("create_bucket", e))?;
                info!(bucket = %self.bucket, "Created bucket");
                Ok(())
            }
            Err(e) => Err(StoreError::request("head_bucket", e)),
        }
    }

    #[instrument(skip(self, path), fields(key = %key))]
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<u64, StoreError> {
        let size = tokio::fs::metadata(path).await?.len();

        if size as usize > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, path, content_type).await?;
        } else {
            self.simple_upload(key, path, content_type).await?;
        }

        debug!(key = %key, size_bytes = size, "Object uploaded");
        Ok(size)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(e) => Err(StoreError::request("head_object", e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::request("delete_object", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_prefix(&self, prefix: &str) -> Result<DeleteReport, StoreError> {
        let mut report = DeleteReport::default();
        let mut continuation: Option<String> = None;

        loop {
            let listing = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StoreError::request("list_objects_v2", e))?;

            let identifiers = listing
                .contents()
                .iter()
                .filter_map(|object| object.key())
                .filter_map(|key| ObjectIdentifier::builder().key(key).build().ok())
                .collect::<Vec<_>>();

            if !identifiers.is_empty() {
                let delete = Delete::builder()
                    .set_objects(Some(identifiers))
                    .build()
                    .map_err(|e| StoreError::request("delete_objects", e))?;

                let response = self
                    .client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| StoreError::request("delete_objects", e))?;

                for error in response.errors() {
                    warn!(
                        key = ?error.key(),
                        message = ?error.message(),
                        "Failed to delete object"
                    );
                }
                report.deleted += response.deleted().len();
                report.failed += response.errors().len();
            }

            match listing.next_continuation_token() {
                Some(token) if listing.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(report)
    }

    async fn presign_get(
        &self,
        key: &str,
        response_content_type: Option<&str>,
    ) -> Result<String, StoreError> {
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_response_content_type(response_content_type.map(str::to_string))
            .presigned(self.presigning_config()?)
            .await
            .map_err(|e| StoreError::request("presign get_object", e))?;

        Ok(request.uri().to_string())
    }

    async fn presign_put(&self, key: &str) -> Result<PresignedUpload, StoreError> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(self.presigning_config()?)
            .await
            .map_err(|e| StoreError::request("presign put_object", e))?;

        Ok(PresignedUpload {
            upload_url: request.uri().to_string(),
            access_url: self.presign_get(key, None).await?,
        })
    }
}

/// Scheme and host a client reached the service through
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedOrigin {
    pub proto: Option<String>,
    pub host: Option<String>,
}

impl ForwardedOrigin {
    pub fn new(proto: Option<&str>, host: Option<&str>) -> Self {
        Self {
            proto: proto.map(str::to_string),
            host: host.map(str::to_string),
        }
    }
}

/// Pure string rewriting of presigned URLs between internal and public hosts
#[derive(Debug, Clone)]
pub struct UrlRewriter {
    internal_endpoint: String,
    public_prefixes: Vec<String>,
    external_path_prefix: String,
}

impl UrlRewriter {
    pub fn new(config: &UrlRewriteConfig) -> Self {
        Self {
            internal_endpoint: config.internal_endpoint.trim_end_matches('/').to_string(),
            public_prefixes: config
                .public_prefixes
                .iter()
                .map(|prefix| prefix.trim_end_matches('/').to_string())
                .collect(),
            external_path_prefix: config.external_path_prefix.trim_matches('/').to_string(),
        }
    }

    /// Map an internal presigned URL to `<proto>://<host>/<prefix>/...`
    pub fn to_external(&self, url: &str, origin: &ForwardedOrigin) -> String {
        let Some(rest) = url.strip_prefix(&self.internal_endpoint) else {
            return url.to_string();
        };
        let proto = origin.proto.as_deref().unwrap_or("http");
        let host = origin.host.as_deref().unwrap_or("localhost");

        format!(
            "{proto}://{host}/{prefix}/{rest}",
            prefix = self.external_path_prefix,
            rest = rest.trim_start_matches('/')
        )
    }

    /// Map a public URL back to the internal endpoint so the service can fetch it
    pub fn to_internal(&self, url: &str) -> String {
        for prefix in &self.public_prefixes {
            if let Some(rest) = url.strip_prefix(prefix.as_str()) {
                return format!(
                    "{}/{}",
                    self.internal_endpoint,
                    rest.trim_start_matches('/')
                );
            }
        }
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> UrlRewriter {
        UrlRewriter::new(&UrlRewriteConfig {
            internal_endpoint: "http://minio:9000/".to_string(),
            public_prefixes: vec!["https://data.example.com/minio/".to_string()],
            external_path_prefix: "minio".to_string(),
        })
    }

    #[test]
    fn test_to_external_defaults_to_http_localhost() {
        let url = rewriter().to_external(
            "http://minio:9000/bucket/a.pcd?X-Amz-Signature=abc",
            &ForwardedOrigin::default(),
        );
        assert_eq!(url, "http://localhost/minio/bucket/a.pcd?X-Amz-Signature=abc");
    }

    #[test]
    fn test_to_external_uses_forwarded_origin() {
        let origin = ForwardedOrigin::new(Some("https"), Some("data.example.com"));
        let url = rewriter().to_external("http://minio:9000/bucket/a.pcd", &origin);
        assert_eq!(url, "https://data.example.com/minio/bucket/a.pcd");
    }

    #[test]
    fn test_foreign_urls_are_left_alone() {
        let rewriter = rewriter();
        let url = "https://cdn.example.org/a.jpg";
        assert_eq!(rewriter.to_external(url, &ForwardedOrigin::default()), url);
        assert_eq!(rewriter.to_internal(url), url);
    }

    #[test]
    fn test_to_internal_maps_public_prefix() {
        let url = rewriter().to_internal("https://data.example.com/minio/bucket/camera/1.jpg");
        assert_eq!(url, "http://minio:9000/bucket/camera/1.jpg");
    }

    #[tokio::test]
    async fn test_read_part_splits_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, vec![1u8; 25]).unwrap();

        let mut file = tokio::fs::File::open(&path).await.unwrap();
        assert_eq!(read_part(&mut file, 10).await.unwrap().len(), 10);
        assert_eq!(read_part(&mut file, 10).await.unwrap().len(), 10);
        assert_eq!(read_part(&mut file, 10).await.unwrap().len(), 5);
        assert!(read_part(&mut file, 10).await.unwrap().is_empty());
    }
}
