//! Persistence seam for bulk-upload tasks and the records they produce.

use async_trait::async_trait;
use bulkup_core::{
    ApplicationForm, ApplicationFormField, BaseField, BulkUploadLog, BulkUploadTask,
    BulkUploadTaskStatus, Changemaker, ChangemakerProposal, IllegalTransition, NewApplicationFormField,
    NewBulkUploadLog, NewBulkUploadTask, NewChangemaker, NewOpportunity, NewProposal,
    NewProposalFieldValue, NewProposalVersion, Opportunity, Proposal, ProposalVersion,
    UnknownVariant,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bulk upload task {0} not found")]
    TaskNotFound(Uuid),
    #[error("file {0} not found")]
    FileNotFound(Uuid),
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
    #[error("decoding column `{column}` failed")]
    Decode {
        column: &'static str,
        #[source]
        source: UnknownVariant,
    },
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("running migrations failed")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("injected failure: {0}")]
    Injected(String),
}

/// Task bookkeeping plus the entry point into a write transaction.
#[async_trait]
pub trait BulkUploadStore: Send + Sync {
    async fn create_bulk_upload_task(
        &self,
        new: &NewBulkUploadTask,
        created_by: Uuid,
    ) -> Result<BulkUploadTask, StoreError>;

    async fn load_bulk_upload_task(&self, id: Uuid) -> Result<BulkUploadTask, StoreError>;

    /// Applies a state-machine checked status change.
    async fn update_bulk_upload_task_status(
        &self,
        id: Uuid,
        status: BulkUploadTaskStatus,
    ) -> Result<BulkUploadTask, StoreError>;

    async fn create_bulk_upload_log(&self, log: &NewBulkUploadLog) -> Result<BulkUploadLog, StoreError>;

    async fn load_base_fields(&self) -> Result<Vec<BaseField>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn IngestTransaction>, StoreError>;
}

/// Writes made through a transaction become visible only after `commit`.
/// Dropping it uncommitted discards them.
#[async_trait]
pub trait IngestTransaction: Send {
    async fn create_opportunity(&mut self, new: &NewOpportunity) -> Result<Opportunity, StoreError>;

    async fn create_application_form(&mut self, opportunity_id: Uuid) -> Result<ApplicationForm, StoreError>;

    async fn create_application_form_field(
        &mut self,
        new: &NewApplicationFormField,
    ) -> Result<ApplicationFormField, StoreError>;

    async fn create_proposal(&mut self, new: &NewProposal) -> Result<Proposal, StoreError>;

    async fn create_proposal_version(
        &mut self,
        new: &NewProposalVersion,
    ) -> Result<ProposalVersion, StoreError>;

    /// Inserts a batch of field values, returning how many were written.
    async fn create_proposal_field_values(
        &mut self,
        values: &[NewProposalFieldValue],
    ) -> Result<u64, StoreError>;

    async fn load_or_create_changemaker(&mut self, new: &NewChangemaker) -> Result<Changemaker, StoreError>;

    async fn create_changemaker_proposal(
        &mut self,
        changemaker_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<ChangemakerProposal, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
