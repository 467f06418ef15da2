use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bulkup_core::{
    BaseField, BaseFieldDataType, BucketLocation, BulkUploadTaskStatus, DataTypeValidator,
    FileReference, NewBulkUploadTask, SensitivityClassification, ValueValidator,
};
use bulkup_ingest::{
    BulkUploadStore, FailPoint, MemoryStore, ProcessOutcome, StoreError, TaskOrchestrator,
};
use bulkup_storage::{FileStager, ObjectResponse, ObjectStorage, ObjectStorageError};
use bytes::Bytes;
use futures::{stream, StreamExt};
use tempfile::TempDir;
use uuid::Uuid;

const ENDPOINT: &str = "http://localhost:9000";

#[derive(Default)]
struct FakeStorage {
    objects: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn get_object(
        &self,
        location: &BucketLocation,
        key: &str,
    ) -> Result<ObjectResponse, ObjectStorageError> {
        let Some(bytes) = self.objects.get(key) else {
            return Err(ObjectStorageError::HttpStatus {
                status: 404,
                url: format!("{ENDPOINT}/{}/{key}", location.name),
            });
        };
        // Two chunks so the stager has to stitch the body together.
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        let chunks = vec![
            Ok(Bytes::copy_from_slice(head)),
            Ok(Bytes::copy_from_slice(tail)),
        ];
        Ok(ObjectResponse {
            content_length: Some(bytes.len() as u64),
            body: Some(stream::iter(chunks).boxed()),
        })
    }
}

fn base_field(short_code: &str, label: &str, data_type: BaseFieldDataType) -> BaseField {
    BaseField {
        short_code: short_code.to_string(),
        label: label.to_string(),
        data_type,
        category: "organization".to_string(),
        sensitivity_classification: SensitivityClassification::Public,
    }
}

fn base_fields() -> Vec<BaseField> {
    vec![
        base_field("organization_tax_id", "Tax ID", BaseFieldDataType::String),
        base_field("organization_name", "Organization Name", BaseFieldDataType::String),
        base_field("budget_total", "Total Budget", BaseFieldDataType::Number),
    ]
}

struct Harness {
    store: MemoryStore,
    storage: FakeStorage,
    staging: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let store = MemoryStore::new();
        store.set_base_fields(base_fields()).await;
        Self {
            store,
            storage: FakeStorage::default(),
            staging: tempfile::tempdir().expect("staging dir"),
        }
    }

    /// Registers a file (uploaded when `csv` is given) and a pending task for it.
    async fn pending_task(&mut self, csv: Option<&str>) -> Uuid {
        let file = FileReference {
            id: Uuid::new_v4(),
            storage_key: format!("uploads/{}.csv", Uuid::new_v4()),
            bucket: BucketLocation {
                name: "bulk-uploads".to_string(),
                region: "us-east-1".to_string(),
                endpoint: ENDPOINT.to_string(),
            },
            mime_type: "text/csv".to_string(),
            size: csv.map(str::len).unwrap_or_default() as i64,
        };
        if let Some(csv) = csv {
            self.storage
                .objects
                .insert(file.storage_key.clone(), csv.as_bytes().to_vec());
        }
        self.store.insert_file(file.clone()).await;
        self.store
            .create_bulk_upload_task(
                &NewBulkUploadTask {
                    source_id: Uuid::new_v4(),
                    file_id: file.id,
                    funder_short_code: "acme_foundation".to_string(),
                },
                Uuid::new_v4(),
            )
            .await
            .expect("create task")
            .id
    }

    fn orchestrator(self) -> (MemoryStore, TaskOrchestrator, TempDir) {
        let stager = FileStager::new(Arc::new(self.storage), self.staging.path());
        let orchestrator = TaskOrchestrator::new(Arc::new(self.store.clone()), stager);
        (self.store, orchestrator, self.staging)
    }
}

fn staged_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).expect("read staging dir").count()
}

async fn assert_nothing_ingested(store: &MemoryStore) {
    let records = store.snapshot().await.records;
    assert!(records.opportunities.is_empty());
    assert!(records.application_forms.is_empty());
    assert!(records.application_form_fields.is_empty());
    assert!(records.proposals.is_empty());
    assert!(records.proposal_versions.is_empty());
    assert!(records.proposal_field_values.is_empty());
    assert!(records.changemakers.is_empty());
    assert!(records.changemaker_proposals.is_empty());
}

#[tokio::test]
async fn well_formed_file_completes_with_full_record_graph() {
    let mut harness = Harness::new().await;
    let task_id = harness
        .pending_task(Some(
            "organization_tax_id,organization_name,budget_total\n12-3456789,Acme,1000\n,Beta,lots\n",
        ))
        .await;
    let (store, orchestrator, staging) = harness.orchestrator();

    let outcome = orchestrator.process(task_id).await.expect("process");
    let ProcessOutcome::Completed { summary } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert_eq!(summary.proposals, 2);
    assert_eq!(summary.field_values, 6);
    assert_eq!(summary.invalid_field_values, 1);
    assert_eq!(summary.changemakers_linked, 1);

    let state = store.snapshot().await;
    let task = state.tasks[&task_id].clone();
    assert_eq!(task.status, BulkUploadTaskStatus::Completed);
    assert_eq!(
        state.statuses_for(task_id),
        vec![BulkUploadTaskStatus::InProgress, BulkUploadTaskStatus::Completed]
    );
    assert!(state.logs_for(task_id).is_empty());

    let records = &state.records;
    assert_eq!(records.opportunities.len(), 1);
    assert!(records.opportunities[0].title.starts_with("Bulk Upload ("));
    assert_eq!(records.opportunities[0].funder_short_code, "acme_foundation");

    assert_eq!(records.application_forms.len(), 1);
    assert_eq!(records.application_forms[0].opportunity_id, records.opportunities[0].id);

    let fields = records
        .application_form_fields
        .iter()
        .map(|f| (f.position, f.base_field_short_code.as_str(), f.label.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        fields,
        vec![
            (0, "organization_tax_id", "Tax ID"),
            (1, "organization_name", "Organization Name"),
            (2, "budget_total", "Total Budget"),
        ]
    );

    let external_ids = records
        .proposals
        .iter()
        .map(|p| p.external_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(external_ids, vec!["1", "2"]);
    assert!(records.proposals.iter().all(|p| p.created_by == task.created_by));
    assert!(records
        .proposal_versions
        .iter()
        .all(|v| v.source_id == task.source_id && v.application_form_id == records.application_forms[0].id));

    assert_eq!(records.changemakers.len(), 1);
    assert_eq!(records.changemakers[0].tax_id, "12-3456789");
    assert_eq!(records.changemakers[0].name, "Acme");

    assert_eq!(staged_files(staging.path()), 0);
}

#[tokio::test]
async fn header_only_file_creates_form_without_proposals() {
    let mut harness = Harness::new().await;
    let task_id = harness.pending_task(Some("organization_name,budget_total\n")).await;
    let (store, orchestrator, _staging) = harness.orchestrator();

    let outcome = orchestrator.process(task_id).await.expect("process");
    assert_eq!(outcome.status(), BulkUploadTaskStatus::Completed);

    let records = store.snapshot().await.records;
    assert_eq!(records.opportunities.len(), 1);
    assert_eq!(records.application_form_fields.len(), 2);
    assert!(records.proposals.is_empty());
}

#[tokio::test]
async fn unknown_header_fails_with_one_error_log() {
    let mut harness = Harness::new().await;
    let task_id = harness
        .pending_task(Some("organization_name,favorite_color\nAcme,blue\n"))
        .await;
    let (store, orchestrator, staging) = harness.orchestrator();

    let outcome = orchestrator.process(task_id).await.expect("process");
    assert_eq!(outcome.status(), BulkUploadTaskStatus::Failed);

    let state = store.snapshot().await;
    assert_eq!(state.tasks[&task_id].status, BulkUploadTaskStatus::Failed);
    let logs = state.logs_for(task_id);
    assert_eq!(logs.len(), 1);
    assert!(logs[0].is_error);
    assert_eq!(logs[0].details.name.as_deref(), Some("CsvSchemaError"));
    assert!(logs[0].details.message.contains("favorite_color"));

    assert_nothing_ingested(&store).await;
    assert_eq!(staged_files(staging.path()), 0);
}

#[tokio::test]
async fn ragged_row_fails_before_anything_is_written() {
    let mut harness = Harness::new().await;
    let task_id = harness
        .pending_task(Some("organization_tax_id,organization_name\n1,Acme\n2\n3,Gamma\n"))
        .await;
    let (store, orchestrator, _staging) = harness.orchestrator();

    let ProcessOutcome::Failed { details } = orchestrator.process(task_id).await.expect("process")
    else {
        panic!("expected failure");
    };
    assert_eq!(details.name.as_deref(), Some("CsvSchemaError"));
    assert!(details.message.contains("data row 2"));
    assert_nothing_ingested(&store).await;
}

#[tokio::test]
async fn failure_midway_through_rows_rolls_everything_back() {
    let mut harness = Harness::new().await;
    let task_id = harness
        .pending_task(Some("organization_name\nAcme\nBeta\nGamma\nDelta\n"))
        .await;
    harness
        .store
        .inject_failure(FailPoint::CreateProposal {
            external_id: "3".to_string(),
        })
        .await;
    let (store, orchestrator, _staging) = harness.orchestrator();

    let ProcessOutcome::Failed { details } = orchestrator.process(task_id).await.expect("process")
    else {
        panic!("expected failure");
    };
    assert_eq!(details.name.as_deref(), Some("IngestError"));
    let cause = details.cause.expect("store error cause");
    assert_eq!(cause.name.as_deref(), Some("StoreError"));

    assert_nothing_ingested(&store).await;
    assert_eq!(store.snapshot().await.logs_for(task_id).len(), 1);
}

#[tokio::test]
async fn commit_failure_marks_task_failed() {
    let mut harness = Harness::new().await;
    let task_id = harness.pending_task(Some("organization_name\nAcme\n")).await;
    harness.store.inject_failure(FailPoint::Commit).await;
    let (store, orchestrator, _staging) = harness.orchestrator();

    let outcome = orchestrator.process(task_id).await.expect("process");
    assert_eq!(outcome.status(), BulkUploadTaskStatus::Failed);
    assert_nothing_ingested(&store).await;
}

#[tokio::test]
async fn base_field_load_failure_is_recorded() {
    let mut harness = Harness::new().await;
    let task_id = harness.pending_task(Some("organization_name\nAcme\n")).await;
    harness.store.inject_failure(FailPoint::LoadBaseFields).await;
    let (store, orchestrator, staging) = harness.orchestrator();

    let ProcessOutcome::Failed { details } = orchestrator.process(task_id).await.expect("process")
    else {
        panic!("expected failure");
    };
    assert_eq!(details.name.as_deref(), Some("StoreError"));
    assert_eq!(store.snapshot().await.logs_for(task_id).len(), 1);
    assert_eq!(staged_files(staging.path()), 0);
}

#[tokio::test]
async fn missing_object_fails_with_download_error() {
    let mut harness = Harness::new().await;
    let task_id = harness.pending_task(None).await;
    let (store, orchestrator, staging) = harness.orchestrator();

    let ProcessOutcome::Failed { details } = orchestrator.process(task_id).await.expect("process")
    else {
        panic!("expected failure");
    };
    assert_eq!(details.name.as_deref(), Some("DownloadError"));
    assert_eq!(
        details.cause.as_ref().and_then(|c| c.name.as_deref()),
        Some("ObjectStorageError")
    );

    let state = store.snapshot().await;
    assert_eq!(
        state.statuses_for(task_id),
        vec![BulkUploadTaskStatus::InProgress, BulkUploadTaskStatus::Failed]
    );
    assert_eq!(state.logs_for(task_id).len(), 1);
    assert_eq!(staged_files(staging.path()), 0);
}

#[tokio::test]
async fn task_that_is_not_pending_is_left_alone() {
    let mut harness = Harness::new().await;
    let task_id = harness.pending_task(Some("organization_name\nAcme\n")).await;
    harness
        .store
        .update_bulk_upload_task_status(task_id, BulkUploadTaskStatus::InProgress)
        .await
        .expect("claim elsewhere");
    let (store, orchestrator, _staging) = harness.orchestrator();

    let outcome = orchestrator.process(task_id).await.expect("process");
    assert_eq!(
        outcome,
        ProcessOutcome::Skipped {
            status: BulkUploadTaskStatus::InProgress
        }
    );

    let state = store.snapshot().await;
    assert_eq!(state.statuses_for(task_id), vec![BulkUploadTaskStatus::InProgress]);
    assert!(state.logs_for(task_id).is_empty());
    assert_nothing_ingested(&store).await;
}

#[tokio::test]
async fn unknown_task_is_an_error() {
    let harness = Harness::new().await;
    let (_store, orchestrator, _staging) = harness.orchestrator();
    let missing = Uuid::new_v4();

    let err = orchestrator.process(missing).await.unwrap_err();
    assert!(matches!(err, StoreError::TaskNotFound(id) if id == missing));
}

/// Deletes everything in the staging directory as a side effect, so the
/// orchestrator's own removal of the staged file fails afterwards.
struct DeletesStagedFiles {
    dir: PathBuf,
}

impl ValueValidator for DeletesStagedFiles {
    fn is_valid(&self, value: &str, data_type: BaseFieldDataType) -> bool {
        for entry in std::fs::read_dir(&self.dir).into_iter().flatten().flatten() {
            let _ = std::fs::remove_file(entry.path());
        }
        DataTypeValidator.is_valid(value, data_type)
    }
}

#[tokio::test]
async fn cleanup_failure_is_logged_without_failing_the_task() {
    let mut harness = Harness::new().await;
    let task_id = harness.pending_task(Some("organization_name\nAcme\n")).await;
    let staging_dir = harness.staging.path().to_path_buf();
    let (store, orchestrator, _staging) = harness.orchestrator();
    let orchestrator = orchestrator.with_validator(Arc::new(DeletesStagedFiles { dir: staging_dir }));

    let outcome = orchestrator.process(task_id).await.expect("process");
    assert_eq!(outcome.status(), BulkUploadTaskStatus::Completed);

    let state = store.snapshot().await;
    assert_eq!(state.tasks[&task_id].status, BulkUploadTaskStatus::Completed);
    let logs = state.logs_for(task_id);
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].is_error);
    assert_eq!(logs[0].details.name.as_deref(), Some("IoError"));
    assert_eq!(state.records.proposals.len(), 1);
}

struct PanickingValidator;

impl ValueValidator for PanickingValidator {
    fn is_valid(&self, _value: &str, _data_type: BaseFieldDataType) -> bool {
        panic!("validator blew up");
    }
}

#[tokio::test]
async fn panic_during_ingestion_fails_the_task() {
    let mut harness = Harness::new().await;
    let task_id = harness.pending_task(Some("organization_name\nAcme\n")).await;
    let (store, orchestrator, staging) = harness.orchestrator();
    let orchestrator = orchestrator.with_validator(Arc::new(PanickingValidator));

    let ProcessOutcome::Failed { details } = orchestrator.process(task_id).await.expect("process")
    else {
        panic!("expected failure");
    };
    assert_eq!(details.name.as_deref(), Some("DefaultError"));
    assert_eq!(details.message, "Received an unexpected type &str");

    assert_nothing_ingested(&store).await;
    assert_eq!(staged_files(staging.path()), 0);
}

#[tokio::test]
async fn error_log_write_failure_still_marks_task_failed() {
    let mut harness = Harness::new().await;
    let task_id = harness.pending_task(Some("favorite_color\nblue\n")).await;
    harness
        .store
        .inject_failure(FailPoint::CreateLog { is_error: true })
        .await;
    let (store, orchestrator, _staging) = harness.orchestrator();

    let err = orchestrator.process(task_id).await.unwrap_err();
    assert!(matches!(err, StoreError::Injected(_)));
    assert_eq!(
        store.snapshot().await.tasks[&task_id].status,
        BulkUploadTaskStatus::Failed
    );
}

#[tokio::test]
async fn changemakers_are_shared_across_tasks() {
    let mut harness = Harness::new().await;
    let csv = "organization_tax_id,organization_name\n12-3456789,Acme\n";
    let first = harness.pending_task(Some(csv)).await;
    let second = harness.pending_task(Some(csv)).await;
    let (store, orchestrator, _staging) = harness.orchestrator();

    for task_id in [first, second] {
        let outcome = orchestrator.process(task_id).await.expect("process");
        assert_eq!(outcome.status(), BulkUploadTaskStatus::Completed);
    }

    let records = store.snapshot().await.records;
    assert_eq!(records.changemakers.len(), 1);
    assert_eq!(records.changemaker_proposals.len(), 2);
    assert!(records
        .changemaker_proposals
        .iter()
        .all(|link| link.changemaker_id == records.changemakers[0].id));
}
