use crate::config::DatabaseConfig;
use crate::export_record::{ExportRecord, ExportRecordStore, ExportStatus, RecordError};
use crate::file_catalog::{CatalogError, FileRegistry, NewFile, StoredFile};
use crate::handler::{ModelClassSource, ResultSink};
use crate::message::{ModelCode, UserContext};
use crate::normalizer::{ClassLookup, DetectionBatchOutcome, ModelClass};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, FromRow)]
struct ExportRecordRow {
    serial_number: Uuid,
    file_name: String,
    status: String,
    generated_num: i64,
    total_num: i64,
    file_id: Option<i64>,
    failed_asset_num: i64,
    created_by: i64,
    dataset_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ExportRecordRow> for ExportRecord {
    type Error = RecordError;

    fn try_from(row: ExportRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            serial_number: row.serial_number,
            file_name: row.file_name,
            status: row.status.parse()?,
            generated_num: row.generated_num,
            total_num: row.total_num,
            file_id: row.file_id,
            failed_asset_num: row.failed_asset_num,
            created_by: row.created_by,
            dataset_id: row.dataset_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// PostgreSQL-backed records, files, model classes and model results
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Create a new store with a connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Explain why a guarded update touched no rows
    async fn rejected(&self, serial: Uuid, to: ExportStatus) -> RecordError {
        match self.find_by_serials(&[serial]).await {
            Ok(records) => match records.into_iter().next() {
                Some(record) => RecordError::InvalidTransition {
                    serial,
                    from: record.status,
                    to,
                },
                None => RecordError::NotFound(serial),
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl ExportRecordStore for PgMetadataStore {
    async fn insert(&self, record: &ExportRecord) -> Result<(), RecordError> {
        sqlx::query(
            r#"
            INSERT INTO export_records (
                serial_number, file_name, status, generated_num, total_num,
                file_id, failed_asset_num, created_by, dataset_id,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.serial_number)
        .bind(&record.file_name)
        .bind(record.status.as_str())
        .bind(record.generated_num)
        .bind(record.total_num)
        .bind(record.file_id)
        .bind(record.failed_asset_num)
        .bind(record.created_by)
        .bind(record.dataset_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_progress(
        &self,
        serial: Uuid,
        generated_num: i64,
        total_num: i64,
    ) -> Result<(), RecordError> {
        let result = sqlx::query(
            r#"
            UPDATE export_records
            SET generated_num = $2, total_num = $3, updated_at = NOW()
            WHERE serial_number = $1 AND status = 'GENERATING'
            "#,
        )
        .bind(serial)
        .bind(generated_num)
        .bind(total_num)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(serial, ExportStatus::Generating).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_completed(
        &self,
        serial: Uuid,
        file_id: i64,
        failed_asset_num: i64,
    ) -> Result<(), RecordError> {
        let result = sqlx::query(
            r#"
            UPDATE export_records
            SET status = 'COMPLETED', file_id = $2, failed_asset_num = $3, updated_at = NOW()
            WHERE serial_number = $1 AND status = 'GENERATING'
            "#,
        )
        .bind(serial)
        .bind(file_id)
        .bind(failed_asset_num)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(serial, ExportStatus::Completed).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_failed(&self, serial: Uuid, failed_asset_num: i64) -> Result<(), RecordError> {
        let result = sqlx::query(
            r#"
            UPDATE export_records
            SET status = 'FAILED', failed_asset_num = $2, updated_at = NOW()
            WHERE serial_number = $1 AND status = 'GENERATING'
            "#,
        )
        .bind(serial)
        .bind(failed_asset_num)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(serial, ExportStatus::Failed).await);
        }
        Ok(())
    }

    async fn find_by_serials(&self, serials: &[Uuid]) -> Result<Vec<ExportRecord>, RecordError> {
        let rows = sqlx::query_as::<_, ExportRecordRow>(
            r#"
            SELECT serial_number, file_name, status, generated_num, total_num,
                   file_id, failed_asset_num, created_by, dataset_id,
                   created_at, updated_at
            FROM export_records
            WHERE serial_number = ANY($1)
            "#,
        )
        .bind(serials)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ExportRecord::try_from).collect()
    }
}

#[async_trait]
impl FileRegistry for PgMetadataStore {
    async fn insert_files(
        &self,
        files: &[(NewFile, i64)],
    ) -> Result<Vec<StoredFile>, CatalogError> {
        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(files.len());

        for (file, hash) in files {
            let row = sqlx::query_as::<_, StoredFile>(
                r#"
                INSERT INTO files (name, path, path_hash, size, content_type, created_by, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                RETURNING id, name, path, path_hash, size, content_type, created_by, created_at
                "#,
            )
            .bind(&file.name)
            .bind(&file.path)
            .bind(hash)
            .bind(file.size)
            .bind(&file.content_type)
            .bind(file.created_by)
            .fetch_one(&mut *tx)
            .await?;
            stored.push(row);
        }

        tx.commit().await?;
        Ok(stored)
    }

    async fn find_files(&self, ids: &[i64]) -> Result<Vec<StoredFile>, CatalogError> {
        let files = sqlx::query_as::<_, StoredFile>(
            r#"
            SELECT id, name, path, path_hash, size, content_type, created_by, created_at
            FROM files
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(files)
    }

    async fn delete_files(&self, ids: &[i64]) -> Result<u64, CatalogError> {
        let result = sqlx::query("DELETE FROM files WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ModelClassSource for PgMetadataStore {
    async fn class_table(&self, model_code: ModelCode) -> Result<ClassLookup> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT code, name FROM model_classes WHERE model_code = $1")
                .bind(model_code.as_str())
                .fetch_all(&self.pool)
                .await
                .context("Failed to load model classes")?;

        Ok(ClassLookup::new(
            rows.into_iter().map(|(code, name)| ModelClass { code, name }),
        ))
    }
}

#[async_trait]
impl ResultSink for PgMetadataStore {
    #[instrument(skip(self, outcomes), fields(count = outcomes.len()))]
    async fn save_outcomes(
        &self,
        ctx: &UserContext,
        model_code: ModelCode,
        outcomes: &[DetectionBatchOutcome],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for outcome in outcomes {
            let objects = serde_json::to_value(&outcome.objects)?;
            sqlx::query(
                r#"
                INSERT INTO model_results (
                    data_id, model_code, status_code, message, confidence,
                    objects, created_by, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                "#,
            )
            .bind(outcome.data_id)
            .bind(model_code.as_str())
            .bind(&outcome.status_code)
            .bind(&outcome.message)
            .bind(outcome.confidence)
            .bind(&objects)
            .bind(ctx.user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to insert model result")?;
        }

        tx.commit().await.context("Failed to commit transaction")?;
        debug!(model_code = %model_code, "Model results saved");
        Ok(())
    }
}
