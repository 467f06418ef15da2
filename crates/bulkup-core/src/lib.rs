//! Core domain model for bulk-upload ingestion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod error_details;
pub mod payload;

pub use error_details::{ErrorDetails, ErrorNamer};
pub use payload::{validate_new_bulk_upload_task, NewBulkUploadTask, PayloadError, PayloadIssue};

pub const CRATE_NAME: &str = "bulkup-core";

/// Short code of the column holding an organization's tax identifier.
pub const TAX_ID_SHORT_CODE: &str = "organization_tax_id";
/// Short code of the column holding an organization's display name.
pub const ORGANIZATION_NAME_SHORT_CODE: &str = "organization_name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkUploadTaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal bulk upload task transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: BulkUploadTaskStatus,
    pub to: BulkUploadTaskStatus,
}

impl BulkUploadTaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Checks a status change against the task state machine:
    /// `pending -> in_progress -> {completed, failed}`.
    pub fn transition_to(self, next: Self) -> Result<Self, IllegalTransition> {
        match (self, next) {
            (Self::Pending, Self::InProgress)
            | (Self::InProgress, Self::Completed)
            | (Self::InProgress, Self::Failed) => Ok(next),
            (from, to) => Err(IllegalTransition { from, to }),
        }
    }
}

impl fmt::Display for BulkUploadTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for BulkUploadTaskStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant {
                kind: "bulk upload task status",
                value: other.to_string(),
            }),
        }
    }
}

/// Where a stored object lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLocation {
    pub name: String,
    pub region: String,
    pub endpoint: String,
}

/// Immutable pointer to an uploaded file, owned outside this pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub id: Uuid,
    pub storage_key: String,
    pub bucket: BucketLocation,
    pub mime_type: String,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkUploadTask {
    pub id: Uuid,
    pub status: BulkUploadTaskStatus,
    pub source_id: Uuid,
    pub file: FileReference,
    pub funder_short_code: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseFieldDataType {
    String,
    Number,
    Integer,
    Boolean,
    Email,
    Url,
    PhoneNumber,
    CurrencyWithCode,
}

impl BaseFieldDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Email => "email",
            Self::Url => "url",
            Self::PhoneNumber => "phone_number",
            Self::CurrencyWithCode => "currency_with_code",
        }
    }
}

impl FromStr for BaseFieldDataType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(Self::String),
            "number" => Ok(Self::Number),
            "integer" => Ok(Self::Integer),
            "boolean" => Ok(Self::Boolean),
            "email" => Ok(Self::Email),
            "url" => Ok(Self::Url),
            "phone_number" => Ok(Self::PhoneNumber),
            "currency_with_code" => Ok(Self::CurrencyWithCode),
            other => Err(UnknownVariant {
                kind: "base field data type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityClassification {
    Public,
    Restricted,
    Forbidden,
}

impl SensitivityClassification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Restricted => "restricted",
            Self::Forbidden => "forbidden",
        }
    }
}

impl FromStr for SensitivityClassification {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "restricted" => Ok(Self::Restricted),
            "forbidden" => Ok(Self::Forbidden),
            other => Err(UnknownVariant {
                kind: "sensitivity classification",
                value: other.to_string(),
            }),
        }
    }
}

/// Registry entry describing a typed field addressed by its short code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseField {
    pub short_code: String,
    pub label: String,
    pub data_type: BaseFieldDataType,
    pub category: String,
    pub sensitivity_classification: SensitivityClassification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOpportunity {
    pub title: String,
    pub funder_short_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub title: String,
    pub funder_short_code: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationForm {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewApplicationFormField {
    pub application_form_id: Uuid,
    pub base_field_short_code: String,
    pub position: i32,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationFormField {
    pub id: Uuid,
    pub application_form_id: Uuid,
    pub base_field_short_code: String,
    pub position: i32,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProposal {
    pub opportunity_id: Uuid,
    pub external_id: String,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub external_id: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProposalVersion {
    pub proposal_id: Uuid,
    pub application_form_id: Uuid,
    pub source_id: Uuid,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalVersion {
    pub id: Uuid,
    pub proposal_id: Uuid,
    pub application_form_id: Uuid,
    pub source_id: Uuid,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProposalFieldValue {
    pub proposal_version_id: Uuid,
    pub application_form_field_id: Uuid,
    pub position: i32,
    pub value: String,
    pub is_valid: bool,
    pub good_as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalFieldValue {
    pub id: Uuid,
    pub proposal_version_id: Uuid,
    pub application_form_field_id: Uuid,
    pub position: i32,
    pub value: String,
    pub is_valid: bool,
    pub good_as_of: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChangemaker {
    pub tax_id: String,
    pub name: String,
}

/// Organization optionally attached to proposals by tax id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changemaker {
    pub id: Uuid,
    pub tax_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangemakerProposal {
    pub id: Uuid,
    pub changemaker_id: Uuid,
    pub proposal_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBulkUploadLog {
    pub bulk_upload_task_id: Uuid,
    pub is_error: bool,
    pub details: ErrorDetails,
}

/// Append-only outcome record for a task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkUploadLog {
    pub id: Uuid,
    pub bulk_upload_task_id: Uuid,
    pub is_error: bool,
    pub details: ErrorDetails,
    pub created_at: DateTime<Utc>,
}

/// Per-value validity check for a base field's data type.
///
/// The verdict is advisory: invalid cells are still stored, flagged.
pub trait ValueValidator: Send + Sync {
    fn is_valid(&self, value: &str, data_type: BaseFieldDataType) -> bool;
}

/// Default rules for the built-in data types. Empty values are always valid.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataTypeValidator;

impl ValueValidator for DataTypeValidator {
    fn is_valid(&self, value: &str, data_type: BaseFieldDataType) -> bool {
        let value = value.trim();
        if value.is_empty() {
            return true;
        }
        match data_type {
            BaseFieldDataType::String => true,
            BaseFieldDataType::Number => value.parse::<f64>().map(f64::is_finite).unwrap_or(false),
            BaseFieldDataType::Integer => value.parse::<i64>().is_ok(),
            BaseFieldDataType::Boolean => {
                matches!(value.to_ascii_lowercase().as_str(), "true" | "false")
            }
            BaseFieldDataType::Email => is_email(value),
            BaseFieldDataType::Url => is_url(value),
            BaseFieldDataType::PhoneNumber => is_phone_number(value),
            BaseFieldDataType::CurrencyWithCode => is_currency_with_code(value),
        }
    }
}

fn is_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.chars().any(char::is_whitespace)
}

fn is_url(value: &str) -> bool {
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"));
    match rest {
        Some(rest) => {
            let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
            !host.is_empty() && !value.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn is_phone_number(value: &str) -> bool {
    let digits = value.chars().filter(char::is_ascii_digit).count();
    let allowed = value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | ' ' | '.'));
    allowed && (7..=15).contains(&digits)
}

// `USD 100.00`: ISO 4217 code, a space, then an amount.
fn is_currency_with_code(value: &str) -> bool {
    let Some((code, amount)) = value.split_once(' ') else {
        return false;
    };
    code.len() == 3
        && code.chars().all(|c| c.is_ascii_uppercase())
        && amount.trim().parse::<f64>().map(f64::is_finite).unwrap_or(false)
}
