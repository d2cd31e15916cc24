//! Job messages carried on the model job topic.
//!
//! A delivery unit is either a single JSON object or a JSON array of objects
//! that share one acknowledgment. Every message in a unit carries the same
//! model code and is handled on behalf of the first message's creator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding a delivery unit
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("failed to deserialize job message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("batch delivery unit is empty")]
    EmptyBatch,
}

/// Identifier of the model a job targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelCode {
    /// Point cloud pre-labeling
    PreLabel,
    /// COCO-80 image detection
    #[serde(rename = "COCO_80")]
    Coco80,
    /// Lidar 3D box detection
    LidarDetection,
}

impl ModelCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelCode::PreLabel => "PRE_LABEL",
            ModelCode::Coco80 => "COCO_80",
            ModelCode::LidarDetection => "LIDAR_DETECTION",
        }
    }
}

impl std::fmt::Display for ModelCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single model job message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    /// Model that should process this job
    pub model_code: ModelCode,
    /// User that submitted the job
    #[serde(alias = "createdBy")]
    pub created_by_user_id: i64,
    /// Model-specific job parameters
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Acting user for the duration of one delivery unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: i64,
}

impl UserContext {
    pub fn new(user_id: i64) -> Self {
        Self { user_id }
    }
}

/// One acknowledgeable unit read from the log
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryUnit {
    Single(JobMessage),
    Batch(Vec<JobMessage>),
}

impl DeliveryUnit {
    /// Decode a raw payload. A leading `[` (after whitespace) selects batch decoding.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(raw)?;

        if text.trim_start().starts_with('[') {
            let messages: Vec<JobMessage> = serde_json::from_str(text)?;
            if messages.is_empty() {
                return Err(DecodeError::EmptyBatch);
            }
            Ok(DeliveryUnit::Batch(messages))
        } else {
            Ok(DeliveryUnit::Single(serde_json::from_str(text)?))
        }
    }

    /// First message of the unit; batches are never empty after decoding
    pub fn lead(&self) -> &JobMessage {
        match self {
            DeliveryUnit::Single(message) => message,
            DeliveryUnit::Batch(messages) => &messages[0],
        }
    }

    pub fn model_code(&self) -> ModelCode {
        self.lead().model_code
    }

    /// Execution context derived from the lead message's creator
    pub fn user_context(&self) -> UserContext {
        UserContext::new(self.lead().created_by_user_id)
    }

    pub fn len(&self) -> usize {
        match self {
            DeliveryUnit::Single(_) => 1,
            DeliveryUnit::Batch(messages) => messages.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_message() {
        let raw = br#"{"modelCode":"LIDAR_DETECTION","createdByUserId":7,"dataId":42}"#;
        let unit = DeliveryUnit::decode(raw).unwrap();

        match &unit {
            DeliveryUnit::Single(message) => {
                assert_eq!(message.model_code, ModelCode::LidarDetection);
                assert_eq!(message.payload.get("dataId"), Some(&serde_json::json!(42)));
            }
            DeliveryUnit::Batch(_) => panic!("expected single message"),
        }
        assert_eq!(unit.user_context(), UserContext::new(7));
    }

    #[test]
    fn test_decode_batch_uses_first_message_context() {
        let raw = br#"  [
            {"modelCode":"PRE_LABEL","createdByUserId":3,"dataId":1},
            {"modelCode":"PRE_LABEL","createdByUserId":9,"dataId":2}
        ]"#;
        let unit = DeliveryUnit::decode(raw).unwrap();

        assert_eq!(unit.len(), 2);
        assert_eq!(unit.model_code(), ModelCode::PreLabel);
        assert_eq!(unit.user_context().user_id, 3);
    }

    #[test]
    fn test_decode_rejects_malformed_and_empty() {
        assert!(matches!(
            DeliveryUnit::decode(b"{not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            DeliveryUnit::decode(b"[]"),
            Err(DecodeError::EmptyBatch)
        ));
        assert!(matches!(
            DeliveryUnit::decode(br#"{"modelCode":"UNKNOWN_MODEL","createdByUserId":1}"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_model_code_serialization() {
        assert_eq!(
            serde_json::to_string(&ModelCode::Coco80).unwrap(),
            "\"COCO_80\""
        );
        assert_eq!(ModelCode::LidarDetection.to_string(), "LIDAR_DETECTION");
    }
}
