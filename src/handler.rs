//! Model-specific job handlers and the registry that dispatches to them.

use crate::message::{JobMessage, ModelCode, UserContext};
use crate::normalizer::{
    normalize_batch, normalize_single, ApiResult, ClassLookup, DetectionBatchOutcome,
    ExtendedRecord, FilterParams, LegacyRecord,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Handler for the job messages of one model.
///
/// Returning `Ok(true)` acknowledges the delivery unit. `Ok(false)` and errors
/// leave it unacknowledged so the log redelivers it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelMessageHandler: Send + Sync {
    /// Model whose messages this handler consumes
    fn model_code(&self) -> ModelCode;

    /// Handle a single job message
    async fn handle(&self, ctx: &UserContext, message: &JobMessage) -> Result<bool>;

    /// Handle a batch of job messages delivered as one unit
    async fn handle_batch(&self, ctx: &UserContext, messages: &[JobMessage]) -> Result<bool>;
}

/// Read-only mapping from model code to handler, built once at startup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ModelCode, Arc<dyn ModelMessageHandler>>,
}

impl HandlerRegistry {
    /// Build the registry keyed by each handler's declared model code
    pub fn new(handlers: impl IntoIterator<Item = Arc<dyn ModelMessageHandler>>) -> Self {
        let mut map: HashMap<ModelCode, Arc<dyn ModelMessageHandler>> = HashMap::new();

        for handler in handlers {
            let code = handler.model_code();
            if map.insert(code, handler).is_some() {
                warn!(model_code = %code, "Duplicate handler registered, keeping the last one");
            }
        }

        info!(handlers = map.len(), "Handler registry initialized");

        Self { handlers: map }
    }

    pub fn get(&self, code: ModelCode) -> Option<&Arc<dyn ModelMessageHandler>> {
        self.handlers.get(&code)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Detection request sent to the inference service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRequest {
    pub data_id: i64,
    pub url: Option<String>,
}

/// Point cloud detection client
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Legacy single-record detection
    async fn detect(&self, request: &DetectionRequest) -> Result<ApiResult<Vec<LegacyRecord>>>;

    /// Extended multi-record detection
    async fn detect_batch(
        &self,
        requests: &[DetectionRequest],
    ) -> Result<ApiResult<Vec<ExtendedRecord>>>;
}

/// Source of the class table configured for a model
#[async_trait]
pub trait ModelClassSource: Send + Sync {
    async fn class_table(&self, model_code: ModelCode) -> Result<ClassLookup>;
}

/// Downstream persistence of normalized outcomes
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save_outcomes(
        &self,
        ctx: &UserContext,
        model_code: ModelCode,
        outcomes: &[DetectionBatchOutcome],
    ) -> Result<()>;
}

/// Inference client speaking JSON over HTTP
pub struct HttpInferenceClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpInferenceClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build inference HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}/{}", self.endpoint, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Inference request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("Inference service rejected request to {url}"))?;

        response
            .json()
            .await
            .context("Failed to decode inference response")
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn detect(&self, request: &DetectionRequest) -> Result<ApiResult<Vec<LegacyRecord>>> {
        self.post("pointcloud/detect", request).await
    }

    async fn detect_batch(
        &self,
        requests: &[DetectionRequest],
    ) -> Result<ApiResult<Vec<ExtendedRecord>>> {
        self.post("pointcloud/detect/batch", requests).await
    }
}

/// Parameters of a point cloud detection job, read from the message payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectionJob {
    data_id: i64,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    result_filter_param: Option<FilterParams>,
}

impl DetectionJob {
    fn from_message(message: &JobMessage) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(message.payload.clone()))
            .context("Invalid detection job payload")
    }

    fn request(&self) -> DetectionRequest {
        DetectionRequest {
            data_id: self.data_id,
            url: self.url.clone(),
        }
    }
}

/// Runs point cloud detection for a model and persists normalized outcomes
pub struct PointCloudDetectionHandler {
    model_code: ModelCode,
    inference: Arc<dyn InferenceClient>,
    classes: Arc<dyn ModelClassSource>,
    sink: Arc<dyn ResultSink>,
}

impl PointCloudDetectionHandler {
    pub fn new(
        model_code: ModelCode,
        inference: Arc<dyn InferenceClient>,
        classes: Arc<dyn ModelClassSource>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            model_code,
            inference,
            classes,
            sink,
        }
    }
}

#[async_trait]
impl ModelMessageHandler for PointCloudDetectionHandler {
    fn model_code(&self) -> ModelCode {
        self.model_code
    }

    #[instrument(skip(self, message), fields(model_code = %self.model_code, user_id = ctx.user_id))]
    async fn handle(&self, ctx: &UserContext, message: &JobMessage) -> Result<bool> {
        let job = DetectionJob::from_message(message)?;
        let classes = self.classes.class_table(self.model_code).await?;
        let response = self.inference.detect(&job.request()).await?;

        let outcome = normalize_single(&response, job.result_filter_param.as_ref(), &classes);
        debug!(
            data_id = job.data_id,
            status = %outcome.status_code,
            objects = outcome.objects.len(),
            "Normalized detection result"
        );

        self.sink
            .save_outcomes(ctx, self.model_code, std::slice::from_ref(&outcome))
            .await?;
        Ok(true)
    }

    #[instrument(skip(self, messages), fields(model_code = %self.model_code, user_id = ctx.user_id, size = messages.len()))]
    async fn handle_batch(&self, ctx: &UserContext, messages: &[JobMessage]) -> Result<bool> {
        let jobs = messages
            .iter()
            .map(DetectionJob::from_message)
            .collect::<Result<Vec<_>>>()?;
        let Some(first) = jobs.first() else {
            return Ok(true);
        };

        if let Some(stray) = messages.iter().find(|m| m.model_code != self.model_code) {
            anyhow::bail!(
                "batch for {} contains a {} job",
                self.model_code,
                stray.model_code
            );
        }
        if jobs
            .iter()
            .any(|job| job.result_filter_param != first.result_filter_param)
        {
            warn!(size = jobs.len(), "Batch jobs carry different filters, applying the first");
        }

        let classes = self.classes.class_table(self.model_code).await?;
        let requests: Vec<DetectionRequest> = jobs.iter().map(DetectionJob::request).collect();
        let response = self.inference.detect_batch(&requests).await?;

        // Batches share one filter; the first job's filter applies to all.
        let outcomes = normalize_batch(&response, first.result_filter_param.as_ref(), &classes);
        if outcomes.is_empty() {
            warn!(
                code = %response.code,
                message = ?response.message,
                requested = requests.len(),
                "Batch detection produced no outcomes"
            );
        }

        self.sink.save_outcomes(ctx, self.model_code, &outcomes).await?;
        Ok(true)
    }
}
