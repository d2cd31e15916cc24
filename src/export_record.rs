//! Export run records and their status machine.
//!
//! A record starts in `GENERATING` and moves exactly once to `COMPLETED` or
//! `FAILED`. Stores reject any write that would leave a terminal state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("export record {0} not found")]
    NotFound(Uuid),

    #[error("export record {serial} cannot move from {from} to {to}")]
    InvalidTransition {
        serial: Uuid,
        from: ExportStatus,
        to: ExportStatus,
    },

    #[error("unknown export status: {0}")]
    UnknownStatus(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportStatus {
    Generating,
    Completed,
    Failed,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Generating => "GENERATING",
            ExportStatus::Completed => "COMPLETED",
            ExportStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExportStatus::Generating)
    }

    /// Progress writes keep `GENERATING`; terminal states accept nothing
    pub fn can_transition_to(&self, next: ExportStatus) -> bool {
        match (self, next) {
            (ExportStatus::Generating, _) => true,
            (ExportStatus::Completed | ExportStatus::Failed, _) => false,
        }
    }
}

impl std::fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GENERATING" => Ok(ExportStatus::Generating),
            "COMPLETED" => Ok(ExportStatus::Completed),
            "FAILED" => Ok(ExportStatus::Failed),
            other => Err(RecordError::UnknownStatus(other.to_string())),
        }
    }
}

/// Externally visible state of one export run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    /// Caller-facing handle, fresh for every run
    pub serial_number: Uuid,
    pub file_name: String,
    pub status: ExportStatus,
    pub generated_num: i64,
    pub total_num: i64,
    /// Registered archive file; set only once COMPLETED
    pub file_id: Option<i64>,
    /// Assets that could not be staged during the run
    pub failed_asset_num: i64,
    pub created_by: i64,
    pub dataset_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExportRecord {
    pub fn new(file_name: impl Into<String>, created_by: i64, dataset_id: Option<i64>) -> Self {
        let now = Utc::now();
        Self {
            serial_number: Uuid::new_v4(),
            file_name: file_name.into(),
            status: ExportStatus::Generating,
            generated_num: 0,
            total_num: 0,
            file_id: None,
            failed_asset_num: 0,
            created_by,
            dataset_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check that this record may be written with `next` as its status
    pub fn ensure_transition(&self, next: ExportStatus) -> Result<(), RecordError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(RecordError::InvalidTransition {
                serial: self.serial_number,
                from: self.status,
                to: next,
            })
        }
    }
}

/// Persistence of export records
#[async_trait]
pub trait ExportRecordStore: Send + Sync {
    async fn insert(&self, record: &ExportRecord) -> Result<(), RecordError>;

    /// Persist progress of a run that is still generating
    async fn update_progress(
        &self,
        serial: Uuid,
        generated_num: i64,
        total_num: i64,
    ) -> Result<(), RecordError>;

    async fn mark_completed(
        &self,
        serial: Uuid,
        file_id: i64,
        failed_asset_num: i64,
    ) -> Result<(), RecordError>;

    async fn mark_failed(&self, serial: Uuid, failed_asset_num: i64) -> Result<(), RecordError>;

    async fn find_by_serials(&self, serials: &[Uuid]) -> Result<Vec<ExportRecord>, RecordError>;
}

/// Create and persist a fresh GENERATING record
pub async fn create_export_record(
    store: &dyn ExportRecordStore,
    file_name: &str,
    created_by: i64,
    dataset_id: Option<i64>,
) -> Result<ExportRecord, RecordError> {
    let record = ExportRecord::new(file_name, created_by, dataset_id);
    store.insert(&record).await?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [ExportStatus::Completed, ExportStatus::Failed] {
            for next in [
                ExportStatus::Generating,
                ExportStatus::Completed,
                ExportStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(ExportStatus::Generating.can_transition_to(ExportStatus::Completed));
        assert!(ExportStatus::Generating.can_transition_to(ExportStatus::Generating));
    }

    #[test]
    fn test_new_record_is_generating_with_fresh_serial() {
        let a = ExportRecord::new("scene", 1, None);
        let b = ExportRecord::new("scene", 1, None);

        assert_eq!(a.status, ExportStatus::Generating);
        assert!(a.file_id.is_none());
        assert_ne!(a.serial_number, b.serial_number);
    }

    #[test]
    fn test_status_parses_from_storage_form() {
        assert_eq!("FAILED".parse::<ExportStatus>().unwrap(), ExportStatus::Failed);
        assert!("DONE".parse::<ExportStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&ExportStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
    }
}
