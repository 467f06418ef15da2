//! Postgres-backed [`BulkUploadStore`].

use async_trait::async_trait;
use bulkup_core::{
    ApplicationForm, ApplicationFormField, BaseField, BucketLocation, BulkUploadLog, BulkUploadTask,
    BulkUploadTaskStatus, Changemaker, ChangemakerProposal, ErrorDetails, FileReference,
    NewApplicationFormField, NewBulkUploadLog, NewBulkUploadTask, NewChangemaker, NewOpportunity,
    NewProposal, NewProposalFieldValue, NewProposalVersion, Opportunity, Proposal, ProposalVersion,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::store::{BulkUploadStore, IngestTransaction, StoreError};

const TASK_SELECT: &str = r#"
    SELECT t.id, t.status, t.source_id, t.funder_short_code, t.created_by, t.created_at,
           f.id AS file_id, f.storage_key, f.mime_type, f.size,
           f.bucket_name, f.bucket_region, f.bucket_endpoint
      FROM bulk_upload_tasks t
      JOIN files f ON f.id = t.file_id
     WHERE t.id = $1
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn decode<T: std::str::FromStr<Err = bulkup_core::UnknownVariant>>(
    row: &PgRow,
    column: &'static str,
) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|source| StoreError::Decode { column, source })
}

fn task_from_row(row: &PgRow) -> Result<BulkUploadTask, StoreError> {
    Ok(BulkUploadTask {
        id: row.try_get("id")?,
        status: decode(row, "status")?,
        source_id: row.try_get("source_id")?,
        file: FileReference {
            id: row.try_get("file_id")?,
            storage_key: row.try_get("storage_key")?,
            bucket: BucketLocation {
                name: row.try_get("bucket_name")?,
                region: row.try_get("bucket_region")?,
                endpoint: row.try_get("bucket_endpoint")?,
            },
            mime_type: row.try_get("mime_type")?,
            size: row.try_get("size")?,
        },
        funder_short_code: row.try_get("funder_short_code")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl BulkUploadStore for PgStore {
    async fn create_bulk_upload_task(
        &self,
        new: &NewBulkUploadTask,
        created_by: Uuid,
    ) -> Result<BulkUploadTask, StoreError> {
        let file_exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM files WHERE id = $1)")
            .bind(new.file_id)
            .fetch_one(&self.pool)
            .await?;
        if !file_exists {
            return Err(StoreError::FileNotFound(new.file_id));
        }

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO bulk_upload_tasks (source_id, file_id, funder_short_code, status, created_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(new.source_id)
        .bind(new.file_id)
        .bind(&new.funder_short_code)
        .bind(BulkUploadTaskStatus::Pending.as_str())
        .bind(created_by)
        .fetch_one(&self.pool)
        .await?;

        self.load_bulk_upload_task(id).await
    }

    async fn load_bulk_upload_task(&self, id: Uuid) -> Result<BulkUploadTask, StoreError> {
        let row = sqlx::query(TASK_SELECT)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TaskNotFound(id))?;
        task_from_row(&row)
    }

    async fn update_bulk_upload_task_status(
        &self,
        id: Uuid,
        status: BulkUploadTaskStatus,
    ) -> Result<BulkUploadTask, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current: String =
            sqlx::query_scalar("SELECT status FROM bulk_upload_tasks WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(StoreError::TaskNotFound(id))?;
        let current: BulkUploadTaskStatus = current.parse().map_err(|source| StoreError::Decode {
            column: "status",
            source,
        })?;
        current.transition_to(status)?;

        sqlx::query("UPDATE bulk_upload_tasks SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.load_bulk_upload_task(id).await
    }

    async fn create_bulk_upload_log(&self, log: &NewBulkUploadLog) -> Result<BulkUploadLog, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO bulk_upload_logs (bulk_upload_task_id, is_error, details)
            VALUES ($1, $2, $3)
            RETURNING id, bulk_upload_task_id, is_error, details, created_at
            "#,
        )
        .bind(log.bulk_upload_task_id)
        .bind(log.is_error)
        .bind(Json(&log.details))
        .fetch_one(&self.pool)
        .await?;

        let details: Json<ErrorDetails> = row.try_get("details")?;
        Ok(BulkUploadLog {
            id: row.try_get("id")?,
            bulk_upload_task_id: row.try_get("bulk_upload_task_id")?,
            is_error: row.try_get("is_error")?,
            details: details.0,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn load_base_fields(&self) -> Result<Vec<BaseField>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT short_code, label, data_type, category, sensitivity_classification
              FROM base_fields
             ORDER BY short_code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(BaseField {
                short_code: row.try_get("short_code")?,
                label: row.try_get("label")?,
                data_type: decode(&row, "data_type")?,
                category: row.try_get("category")?,
                sensitivity_classification: decode(&row, "sensitivity_classification")?,
            });
        }
        Ok(out)
    }

    async fn begin(&self) -> Result<Box<dyn IngestTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgIngestTransaction { tx }))
    }
}

/// Wraps one sqlx transaction; sqlx rolls back on drop if never committed.
pub struct PgIngestTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl IngestTransaction for PgIngestTransaction {
    async fn create_opportunity(&mut self, new: &NewOpportunity) -> Result<Opportunity, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO opportunities (title, funder_short_code)
            VALUES ($1, $2)
            RETURNING id, title, funder_short_code, created_at
            "#,
        )
        .bind(&new.title)
        .bind(&new.funder_short_code)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(Opportunity {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            funder_short_code: row.try_get("funder_short_code")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn create_application_form(&mut self, opportunity_id: Uuid) -> Result<ApplicationForm, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO application_forms (opportunity_id)
            VALUES ($1)
            RETURNING id, opportunity_id, created_at
            "#,
        )
        .bind(opportunity_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(ApplicationForm {
            id: row.try_get("id")?,
            opportunity_id: row.try_get("opportunity_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn create_application_form_field(
        &mut self,
        new: &NewApplicationFormField,
    ) -> Result<ApplicationFormField, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO application_form_fields (application_form_id, base_field_short_code, position, label)
            VALUES ($1, $2, $3, $4)
            RETURNING id, application_form_id, base_field_short_code, position, label, created_at
            "#,
        )
        .bind(new.application_form_id)
        .bind(&new.base_field_short_code)
        .bind(new.position)
        .bind(&new.label)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(ApplicationFormField {
            id: row.try_get("id")?,
            application_form_id: row.try_get("application_form_id")?,
            base_field_short_code: row.try_get("base_field_short_code")?,
            position: row.try_get("position")?,
            label: row.try_get("label")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn create_proposal(&mut self, new: &NewProposal) -> Result<Proposal, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO proposals (opportunity_id, external_id, created_by)
            VALUES ($1, $2, $3)
            RETURNING id, opportunity_id, external_id, created_by, created_at
            "#,
        )
        .bind(new.opportunity_id)
        .bind(&new.external_id)
        .bind(new.created_by)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(Proposal {
            id: row.try_get("id")?,
            opportunity_id: row.try_get("opportunity_id")?,
            external_id: row.try_get("external_id")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn create_proposal_version(
        &mut self,
        new: &NewProposalVersion,
    ) -> Result<ProposalVersion, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO proposal_versions (proposal_id, application_form_id, source_id, created_by)
            VALUES ($1, $2, $3, $4)
            RETURNING id, proposal_id, application_form_id, source_id, created_by, created_at
            "#,
        )
        .bind(new.proposal_id)
        .bind(new.application_form_id)
        .bind(new.source_id)
        .bind(new.created_by)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(ProposalVersion {
            id: row.try_get("id")?,
            proposal_id: row.try_get("proposal_id")?,
            application_form_id: row.try_get("application_form_id")?,
            source_id: row.try_get("source_id")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn create_proposal_field_values(
        &mut self,
        values: &[NewProposalFieldValue],
    ) -> Result<u64, StoreError> {
        if values.is_empty() {
            return Ok(0);
        }

        let version_ids = values.iter().map(|v| v.proposal_version_id).collect::<Vec<Uuid>>();
        let field_ids = values
            .iter()
            .map(|v| v.application_form_field_id)
            .collect::<Vec<Uuid>>();
        let positions = values.iter().map(|v| v.position).collect::<Vec<i32>>();
        let raw_values = values.iter().map(|v| v.value.clone()).collect::<Vec<String>>();
        let validity = values.iter().map(|v| v.is_valid).collect::<Vec<bool>>();
        let good_as_of = values
            .iter()
            .map(|v| v.good_as_of)
            .collect::<Vec<Option<DateTime<Utc>>>>();

        // A single UNNEST insert writes every cell of the row in one round trip.
        let result = sqlx::query(
            r#"
            INSERT INTO proposal_field_values
                (proposal_version_id, application_form_field_id, position, value, is_valid, good_as_of)
            SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::int4[], $4::text[], $5::bool[], $6::timestamptz[])
            "#,
        )
        .bind(&version_ids)
        .bind(&field_ids)
        .bind(&positions)
        .bind(&raw_values)
        .bind(&validity)
        .bind(&good_as_of)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn load_or_create_changemaker(&mut self, new: &NewChangemaker) -> Result<Changemaker, StoreError> {
        // The no-op update makes RETURNING yield the row that won the conflict,
        // including one committed by a concurrent transaction after our snapshot.
        let row = sqlx::query(
            r#"
            INSERT INTO changemakers (tax_id, name)
            VALUES ($1, $2)
            ON CONFLICT (tax_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, tax_id, name, created_at
            "#,
        )
        .bind(&new.tax_id)
        .bind(&new.name)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(Changemaker {
            id: row.try_get("id")?,
            tax_id: row.try_get("tax_id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn create_changemaker_proposal(
        &mut self,
        changemaker_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<ChangemakerProposal, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO changemakers_proposals (changemaker_id, proposal_id)
            VALUES ($1, $2)
            RETURNING id, changemaker_id, proposal_id, created_at
            "#,
        )
        .bind(changemaker_id)
        .bind(proposal_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(ChangemakerProposal {
            id: row.try_get("id")?,
            changemaker_id: row.try_get("changemaker_id")?,
            proposal_id: row.try_get("proposal_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
