//! Boundary validation for bulk-upload task creation payloads.

use std::sync::OnceLock;

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBulkUploadTask {
    pub source_id: Uuid,
    pub file_id: Uuid,
    pub funder_short_code: String,
}

/// One problem found in a payload, addressed by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadIssue {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for PayloadIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid bulk upload task payload: {}", join_issues(.issues))]
pub struct PayloadError {
    pub issues: Vec<PayloadIssue>,
}

impl From<Vec<PayloadIssue>> for PayloadError {
    fn from(issues: Vec<PayloadIssue>) -> Self {
        Self { issues }
    }
}

fn join_issues(issues: &[PayloadIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

const UUID_PATTERN: &str =
    "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$";

static SCHEMA: OnceLock<Option<JSONSchema>> = OnceLock::new();

/// JSON Schema for the task-creation payload.
fn new_bulk_upload_task_schema() -> JsonValue {
    json!({
        "type": "object",
        "required": ["sourceId", "fileId", "funderShortCode"],
        "additionalProperties": false,
        "properties": {
            "sourceId": { "type": "string", "pattern": UUID_PATTERN },
            "fileId": { "type": "string", "pattern": UUID_PATTERN },
            "funderShortCode": { "type": "string", "pattern": "\\S" }
        }
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Payload {
    source_id: Uuid,
    file_id: Uuid,
    funder_short_code: String,
}

/// Checks a `{sourceId, fileId, funderShortCode}` payload and reports every
/// issue found rather than the first one.
pub fn validate_new_bulk_upload_task(
    payload: &JsonValue,
) -> Result<NewBulkUploadTask, Vec<PayloadIssue>> {
    let Some(schema) = SCHEMA
        .get_or_init(|| JSONSchema::compile(&new_bulk_upload_task_schema()).ok())
        .as_ref()
    else {
        return Err(vec![PayloadIssue {
            path: String::new(),
            message: "payload schema failed to compile".to_string(),
        }]);
    };

    if let Err(errors) = schema.validate(payload) {
        let mut issues = errors
            .map(|err| PayloadIssue {
                path: err.instance_path.to_string(),
                message: err.to_string(),
            })
            .collect::<Vec<_>>();
        issues.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.message.cmp(&b.message)));
        return Err(issues);
    }

    let parsed: Payload = serde_json::from_value(payload.clone()).map_err(|err| {
        vec![PayloadIssue {
            path: String::new(),
            message: err.to_string(),
        }]
    })?;
    Ok(NewBulkUploadTask {
        source_id: parsed.source_id,
        file_id: parsed.file_id,
        funder_short_code: parsed.funder_short_code,
    })
}
