//! Drives one bulk-upload task from PENDING to a terminal status.

use std::error::Error as StdError;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bulkup_core::error_details::serialize_error;
use bulkup_core::{
    BulkUploadTask, BulkUploadTaskStatus, DataTypeValidator, ErrorDetails, NewApplicationFormField,
    NewBulkUploadLog, NewOpportunity, ValueValidator,
};
use bulkup_storage::{DownloadError, FileStager, ObjectStorageError, StagedFile};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::columns::{BaseFieldRegistry, ColumnMapper, ColumnMappingError};
use crate::csv_schema::{csv_reader, CsvSchemaError, CsvSchemaValidator};
use crate::ingester::{FormColumn, IngestError, IngestSummary, IngestTarget, RecordIngester};
use crate::store::{BulkUploadStore, IngestTransaction, StoreError};

pub const DEFAULT_CHANGEMAKER_NAME: &str = "Unknown organization";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// The task was not PENDING when picked up and was left alone.
    Skipped { status: BulkUploadTaskStatus },
    Completed { summary: IngestSummary },
    Failed { details: ErrorDetails },
}

impl ProcessOutcome {
    pub fn status(&self) -> BulkUploadTaskStatus {
        match self {
            Self::Skipped { status } => *status,
            Self::Completed { .. } => BulkUploadTaskStatus::Completed,
            Self::Failed { .. } => BulkUploadTaskStatus::Failed,
        }
    }
}

/// Everything that can stop a claimed task. Each variant is recorded as the
/// task's single error log.
#[derive(Debug, Error)]
enum TaskStageError {
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Schema(#[from] CsvSchemaError),
    #[error(transparent)]
    Mapping(#[from] ColumnMappingError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TaskStageError {
    fn inner(&self) -> &(dyn StdError + 'static) {
        match self {
            Self::Download(err) => err,
            Self::Schema(err) => err,
            Self::Mapping(err) => err,
            Self::Ingest(err) => err,
            Self::Store(err) => err,
            Self::Io(err) => err,
        }
    }

    fn details(&self) -> ErrorDetails {
        serialize_error(self.inner(), &[], error_name)
    }
}

/// Names the error types this pipeline produces, for stored log entries.
pub fn error_name(err: &(dyn StdError + 'static)) -> Option<&'static str> {
    if err.is::<DownloadError>() {
        Some("DownloadError")
    } else if err.is::<ObjectStorageError>() {
        Some("ObjectStorageError")
    } else if err.is::<CsvSchemaError>() {
        Some("CsvSchemaError")
    } else if err.is::<ColumnMappingError>() {
        Some("ColumnMappingError")
    } else if err.is::<IngestError>() {
        Some("IngestError")
    } else if err.is::<StoreError>() {
        Some("StoreError")
    } else if err.is::<csv::Error>() {
        Some("CsvError")
    } else if err.is::<sqlx::Error>() {
        Some("DatabaseError")
    } else if err.is::<io::Error>() {
        Some("IoError")
    } else {
        None
    }
}

#[derive(Clone)]
pub struct TaskOrchestrator {
    store: Arc<dyn BulkUploadStore>,
    stager: FileStager,
    validator: Arc<dyn ValueValidator>,
    default_changemaker_name: String,
}

impl TaskOrchestrator {
    pub fn new(store: Arc<dyn BulkUploadStore>, stager: FileStager) -> Self {
        Self {
            store,
            stager,
            validator: Arc::new(DataTypeValidator),
            default_changemaker_name: DEFAULT_CHANGEMAKER_NAME.to_string(),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ValueValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_default_changemaker_name(mut self, name: impl Into<String>) -> Self {
        self.default_changemaker_name = name.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn BulkUploadStore> {
        &self.store
    }

    /// Processes one task. Failures inside the pipeline end in FAILED with one
    /// error log and are reported through [`ProcessOutcome::Failed`]; the
    /// returned `Err` is reserved for bookkeeping writes that could not be made.
    pub async fn process(&self, task_id: Uuid) -> Result<ProcessOutcome, StoreError> {
        let span = info_span!("bulk_upload_task", %task_id);
        self.process_inner(task_id).instrument(span).await
    }

    async fn process_inner(&self, task_id: Uuid) -> Result<ProcessOutcome, StoreError> {
        let task = self.store.load_bulk_upload_task(task_id).await?;
        if task.status != BulkUploadTaskStatus::Pending {
            warn!(status = %task.status, "task is not pending; skipping");
            return Ok(ProcessOutcome::Skipped {
                status: task.status,
            });
        }

        // Plain status write; two workers racing on one task can both pass
        // the pending check above.
        self.store
            .update_bulk_upload_task_status(task_id, BulkUploadTaskStatus::InProgress)
            .await?;
        info!(
            file_id = %task.file.id,
            storage_key = %task.file.storage_key,
            "claimed bulk upload task"
        );

        let staged = match self.stager.stage(&task.file).await {
            Ok(staged) => staged,
            Err(err) => {
                return self
                    .fail(task_id, TaskStageError::from(err).details())
                    .await
            }
        };
        info!(byte_size = staged.byte_size(), "staged upload");

        let result = AssertUnwindSafe(self.run_stages(&task, &staged))
            .catch_unwind()
            .await;

        self.cleanup(task_id, staged).await;

        match result {
            Ok(Ok(summary)) => {
                self.store
                    .update_bulk_upload_task_status(task_id, BulkUploadTaskStatus::Completed)
                    .await?;
                info!(
                    proposals = summary.proposals,
                    field_values = summary.field_values,
                    invalid_field_values = summary.invalid_field_values,
                    changemakers_linked = summary.changemakers_linked,
                    "bulk upload task completed"
                );
                Ok(ProcessOutcome::Completed { summary })
            }
            Ok(Err(err)) => self.fail(task_id, err.details()).await,
            Err(panic) => self.fail(task_id, ErrorDetails::from_panic(panic.as_ref())).await,
        }
    }

    async fn run_stages(
        &self,
        task: &BulkUploadTask,
        staged: &StagedFile,
    ) -> Result<IngestSummary, TaskStageError> {
        let registry = BaseFieldRegistry::new(self.store.load_base_fields().await?);
        let shape = CsvSchemaValidator::new(&registry).validate(staged.open()?)?;
        info!(
            columns = shape.header.len(),
            data_rows = shape.data_rows,
            "validated CSV"
        );

        let mut tx = self.store.begin().await?;
        let written = self
            .write_records(tx.as_mut(), task, &registry, &shape.header, staged)
            .await;
        match written {
            Ok(summary) => {
                tx.commit().await?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rolling back ingestion failed");
                }
                Err(err)
            }
        }
    }

    async fn write_records(
        &self,
        tx: &mut dyn IngestTransaction,
        task: &BulkUploadTask,
        registry: &BaseFieldRegistry,
        header: &[String],
        staged: &StagedFile,
    ) -> Result<IngestSummary, TaskStageError> {
        let specs = ColumnMapper::new(registry).map(header)?;

        let opportunity = tx
            .create_opportunity(&NewOpportunity {
                title: opportunity_title(task),
                funder_short_code: task.funder_short_code.clone(),
            })
            .await?;
        let form = tx.create_application_form(opportunity.id).await?;

        let mut columns = Vec::with_capacity(specs.len());
        for spec in specs {
            let field = tx
                .create_application_form_field(&NewApplicationFormField {
                    application_form_id: form.id,
                    base_field_short_code: spec.base_field_short_code,
                    position: spec.position,
                    label: spec.label,
                })
                .await?;
            columns.push(FormColumn {
                position: spec.position,
                application_form_field_id: field.id,
                base_field_short_code: field.base_field_short_code,
                data_type: spec.data_type,
            });
        }

        let target = IngestTarget {
            opportunity_id: opportunity.id,
            application_form_id: form.id,
            source_id: task.source_id,
            created_by: task.created_by,
        };
        let rows = csv_reader(staged.open()?).into_records().skip(1);
        let summary = RecordIngester::new(self.validator.as_ref(), &self.default_changemaker_name)
            .ingest(tx, rows, &columns, &target)
            .await?;
        Ok(summary)
    }

    /// Removal problems are kept as a non-error log; they never change the
    /// task's outcome.
    async fn cleanup(&self, task_id: Uuid, staged: StagedFile) {
        let path = staged.path().display().to_string();
        let Err(err) = staged.cleanup() else {
            return;
        };
        warn!(%path, error = %err, "removing staged file failed");
        let log = NewBulkUploadLog {
            bulk_upload_task_id: task_id,
            is_error: false,
            details: TaskStageError::Io(err).details(),
        };
        if let Err(log_err) = self.store.create_bulk_upload_log(&log).await {
            warn!(error = %log_err, "recording staged file cleanup failure failed");
        }
    }

    async fn fail(&self, task_id: Uuid, details: ErrorDetails) -> Result<ProcessOutcome, StoreError> {
        error!(
            error = %details.message,
            name = details.name.as_deref().unwrap_or_default(),
            "bulk upload task failed"
        );
        let logged = self
            .store
            .create_bulk_upload_log(&NewBulkUploadLog {
                bulk_upload_task_id: task_id,
                is_error: true,
                details: details.clone(),
            })
            .await;
        self.store
            .update_bulk_upload_task_status(task_id, BulkUploadTaskStatus::Failed)
            .await?;
        logged?;
        Ok(ProcessOutcome::Failed { details })
    }
}

fn opportunity_title(task: &BulkUploadTask) -> String {
    format!("Bulk Upload ({})", task.created_at.to_rfc3339())
}
