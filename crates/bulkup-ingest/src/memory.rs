//! In-process [`BulkUploadStore`] with transactional staging and failure
//! injection, for tests and dry runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bulkup_core::{
    ApplicationForm, ApplicationFormField, BaseField, BulkUploadLog, BulkUploadTask,
    BulkUploadTaskStatus, Changemaker, ChangemakerProposal, FileReference, NewApplicationFormField,
    NewBulkUploadLog, NewBulkUploadTask, NewChangemaker, NewOpportunity, NewProposal,
    NewProposalFieldValue, NewProposalVersion, Opportunity, Proposal, ProposalFieldValue,
    ProposalVersion,
};
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{BulkUploadStore, IngestTransaction, StoreError};

/// Point at which an injected failure fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailPoint {
    LoadBaseFields,
    /// Creating the proposal with this external id (the 1-based data row).
    CreateProposal { external_id: String },
    Commit,
    CreateLog { is_error: bool },
}

/// Entity graph written by ingestion, shared by committed state and open
/// transactions.
#[derive(Debug, Clone, Default)]
pub struct IngestedRecords {
    pub opportunities: Vec<Opportunity>,
    pub application_forms: Vec<ApplicationForm>,
    pub application_form_fields: Vec<ApplicationFormField>,
    pub proposals: Vec<Proposal>,
    pub proposal_versions: Vec<ProposalVersion>,
    pub proposal_field_values: Vec<ProposalFieldValue>,
    pub changemakers: Vec<Changemaker>,
    pub changemaker_proposals: Vec<ChangemakerProposal>,
}

impl IngestedRecords {
    fn append(&mut self, other: IngestedRecords) {
        self.opportunities.extend(other.opportunities);
        self.application_forms.extend(other.application_forms);
        self.application_form_fields.extend(other.application_form_fields);
        self.proposals.extend(other.proposals);
        self.proposal_versions.extend(other.proposal_versions);
        self.proposal_field_values.extend(other.proposal_field_values);
        self.changemakers.extend(other.changemakers);
        self.changemaker_proposals.extend(other.changemaker_proposals);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub files: HashMap<Uuid, FileReference>,
    pub tasks: HashMap<Uuid, BulkUploadTask>,
    /// Every status a task has been moved to, in order.
    pub status_history: Vec<(Uuid, BulkUploadTaskStatus)>,
    pub logs: Vec<BulkUploadLog>,
    pub base_fields: Vec<BaseField>,
    pub records: IngestedRecords,
}

impl MemoryState {
    pub fn logs_for(&self, task_id: Uuid) -> Vec<&BulkUploadLog> {
        self.logs
            .iter()
            .filter(|log| log.bulk_upload_task_id == task_id)
            .collect()
    }

    pub fn statuses_for(&self, task_id: Uuid) -> Vec<BulkUploadTaskStatus> {
        self.status_history
            .iter()
            .filter(|(id, _)| *id == task_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    failures: Arc<Mutex<Vec<FailPoint>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_file(&self, file: FileReference) {
        self.state.lock().await.files.insert(file.id, file);
    }

    pub async fn set_base_fields(&self, base_fields: Vec<BaseField>) {
        self.state.lock().await.base_fields = base_fields;
    }

    pub async fn inject_failure(&self, point: FailPoint) {
        self.failures.lock().await.push(point);
    }

    pub async fn clear_failures(&self) {
        self.failures.lock().await.clear();
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    async fn check_failure(&self, point: &FailPoint) -> Result<(), StoreError> {
        check_failure(&self.failures, point).await
    }
}

async fn check_failure(failures: &Mutex<Vec<FailPoint>>, point: &FailPoint) -> Result<(), StoreError> {
    if failures.lock().await.contains(point) {
        return Err(StoreError::Injected(format!("{point:?}")));
    }
    Ok(())
}

#[async_trait]
impl BulkUploadStore for MemoryStore {
    async fn create_bulk_upload_task(
        &self,
        new: &NewBulkUploadTask,
        created_by: Uuid,
    ) -> Result<BulkUploadTask, StoreError> {
        let mut state = self.state.lock().await;
        let file = state
            .files
            .get(&new.file_id)
            .cloned()
            .ok_or(StoreError::FileNotFound(new.file_id))?;
        let task = BulkUploadTask {
            id: Uuid::new_v4(),
            status: BulkUploadTaskStatus::Pending,
            source_id: new.source_id,
            file,
            funder_short_code: new.funder_short_code.clone(),
            created_by,
            created_at: Utc::now(),
        };
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn load_bulk_upload_task(&self, id: Uuid) -> Result<BulkUploadTask, StoreError> {
        self.state
            .lock()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn update_bulk_upload_task_status(
        &self,
        id: Uuid,
        status: BulkUploadTaskStatus,
    ) -> Result<BulkUploadTask, StoreError> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.status = task.status.transition_to(status)?;
        let task = task.clone();
        state.status_history.push((id, status));
        Ok(task)
    }

    async fn create_bulk_upload_log(&self, log: &NewBulkUploadLog) -> Result<BulkUploadLog, StoreError> {
        self.check_failure(&FailPoint::CreateLog {
            is_error: log.is_error,
        })
        .await?;
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(&log.bulk_upload_task_id) {
            return Err(StoreError::TaskNotFound(log.bulk_upload_task_id));
        }
        let entry = BulkUploadLog {
            id: Uuid::new_v4(),
            bulk_upload_task_id: log.bulk_upload_task_id,
            is_error: log.is_error,
            details: log.details.clone(),
            created_at: Utc::now(),
        };
        state.logs.push(entry.clone());
        Ok(entry)
    }

    async fn load_base_fields(&self) -> Result<Vec<BaseField>, StoreError> {
        self.check_failure(&FailPoint::LoadBaseFields).await?;
        Ok(self.state.lock().await.base_fields.clone())
    }

    async fn begin(&self) -> Result<Box<dyn IngestTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            failures: self.failures.clone(),
            pending: IngestedRecords::default(),
        }))
    }
}

pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    failures: Arc<Mutex<Vec<FailPoint>>>,
    pending: IngestedRecords,
}

#[async_trait]
impl IngestTransaction for MemoryTransaction {
    async fn create_opportunity(&mut self, new: &NewOpportunity) -> Result<Opportunity, StoreError> {
        let opportunity = Opportunity {
            id: Uuid::new_v4(),
            title: new.title.clone(),
            funder_short_code: new.funder_short_code.clone(),
            created_at: Utc::now(),
        };
        self.pending.opportunities.push(opportunity.clone());
        Ok(opportunity)
    }

    async fn create_application_form(&mut self, opportunity_id: Uuid) -> Result<ApplicationForm, StoreError> {
        let form = ApplicationForm {
            id: Uuid::new_v4(),
            opportunity_id,
            created_at: Utc::now(),
        };
        self.pending.application_forms.push(form.clone());
        Ok(form)
    }

    async fn create_application_form_field(
        &mut self,
        new: &NewApplicationFormField,
    ) -> Result<ApplicationFormField, StoreError> {
        let field = ApplicationFormField {
            id: Uuid::new_v4(),
            application_form_id: new.application_form_id,
            base_field_short_code: new.base_field_short_code.clone(),
            position: new.position,
            label: new.label.clone(),
            created_at: Utc::now(),
        };
        self.pending.application_form_fields.push(field.clone());
        Ok(field)
    }

    async fn create_proposal(&mut self, new: &NewProposal) -> Result<Proposal, StoreError> {
        check_failure(
            &self.failures,
            &FailPoint::CreateProposal {
                external_id: new.external_id.clone(),
            },
        )
        .await?;
        let proposal = Proposal {
            id: Uuid::new_v4(),
            opportunity_id: new.opportunity_id,
            external_id: new.external_id.clone(),
            created_by: new.created_by,
            created_at: Utc::now(),
        };
        self.pending.proposals.push(proposal.clone());
        Ok(proposal)
    }

    async fn create_proposal_version(
        &mut self,
        new: &NewProposalVersion,
    ) -> Result<ProposalVersion, StoreError> {
        let version = ProposalVersion {
            id: Uuid::new_v4(),
            proposal_id: new.proposal_id,
            application_form_id: new.application_form_id,
            source_id: new.source_id,
            created_by: new.created_by,
            created_at: Utc::now(),
        };
        self.pending.proposal_versions.push(version.clone());
        Ok(version)
    }

    async fn create_proposal_field_values(
        &mut self,
        values: &[NewProposalFieldValue],
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        self.pending
            .proposal_field_values
            .extend(values.iter().map(|v| ProposalFieldValue {
                id: Uuid::new_v4(),
                proposal_version_id: v.proposal_version_id,
                application_form_field_id: v.application_form_field_id,
                position: v.position,
                value: v.value.clone(),
                is_valid: v.is_valid,
                good_as_of: v.good_as_of,
                created_at: now,
            }));
        Ok(values.len() as u64)
    }

    async fn load_or_create_changemaker(&mut self, new: &NewChangemaker) -> Result<Changemaker, StoreError> {
        let matches = |c: &&Changemaker| c.tax_id == new.tax_id && c.name == new.name;
        if let Some(existing) = self.pending.changemakers.iter().find(matches) {
            return Ok(existing.clone());
        }
        if let Some(existing) = self.state.lock().await.records.changemakers.iter().find(matches) {
            return Ok(existing.clone());
        }
        let changemaker = Changemaker {
            id: Uuid::new_v4(),
            tax_id: new.tax_id.clone(),
            name: new.name.clone(),
            created_at: Utc::now(),
        };
        self.pending.changemakers.push(changemaker.clone());
        Ok(changemaker)
    }

    async fn create_changemaker_proposal(
        &mut self,
        changemaker_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<ChangemakerProposal, StoreError> {
        let link = ChangemakerProposal {
            id: Uuid::new_v4(),
            changemaker_id,
            proposal_id,
            created_at: Utc::now(),
        };
        self.pending.changemaker_proposals.push(link.clone());
        Ok(link)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        check_failure(&self.failures, &FailPoint::Commit).await?;
        let MemoryTransaction { state, pending, .. } = *self;
        state.lock().await.records.append(pending);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
