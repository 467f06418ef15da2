//! JSON-safe rendering of failures for `bulk_upload_logs.details`.
//!
//! Error cause chains are walked through [`std::error::Error::source`]. A
//! hand-written `source` can point back at an earlier error, so every step
//! carries the errors already seen on its own path and stops with a sentinel
//! entry once it revisits one.
//!
//! An error is identified by its whole `dyn Error` pointer, data address and
//! vtable together. A wrapper and the source stored at offset zero inside it
//! share an address but not a vtable, so they stay distinct.

use std::any::Any;
use std::error::Error;
use std::ptr;

use serde::{Deserialize, Serialize};

pub const CYCLE_DETECTED_MESSAGE: &str = "A cycle was detected in the error cause chain.";
pub const DEFAULT_ERROR_NAME: &str = "DefaultError";
pub const GENERIC_ERROR_NAME: &str = "Error";
/// Chains deeper than this are cut off with the cycle sentinel.
pub const MAX_CAUSE_DEPTH: usize = 64;

/// Errors already visited on the current path, outermost first.
pub type Visited = [*const (dyn Error + 'static)];

/// Maps a concrete error to a display name; `None` falls back to `"Error"`.
pub type ErrorNamer = fn(&(dyn Error + 'static)) -> Option<&'static str>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorDetails>>,
}

impl ErrorDetails {
    pub fn from_error(err: &(dyn Error + 'static)) -> Self {
        Self::from_error_named(err, |_| None)
    }

    pub fn from_error_named(err: &(dyn Error + 'static), namer: ErrorNamer) -> Self {
        serialize_error(err, &[], namer)
    }

    /// Lossy entry for a failure value that is not an error type.
    pub fn unexpected_type(type_name: &str) -> Self {
        Self {
            message: format!("Received an unexpected type {type_name}"),
            name: Some(DEFAULT_ERROR_NAME.to_string()),
            cause: None,
        }
    }

    pub fn unexpected_value<T: ?Sized>(_value: &T) -> Self {
        Self::unexpected_type(std::any::type_name::<T>())
    }

    /// Renders a caught panic payload. Payloads are never error types.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let type_name = if payload.is::<&'static str>() {
            "&str"
        } else if payload.is::<String>() {
            "String"
        } else {
            "Box<dyn Any + Send>"
        };
        Self::unexpected_type(type_name)
    }

    /// Plain informational entry, used for non-error logs.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: None,
            cause: None,
        }
    }

    pub fn cycle_detected() -> Self {
        Self::message(CYCLE_DETECTED_MESSAGE)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("message".into(), self.message.clone().into());
        if let Some(name) = &self.name {
            map.insert("name".into(), name.clone().into());
        }
        if let Some(cause) = &self.cause {
            map.insert("cause".into(), cause.to_json());
        }
        serde_json::Value::Object(map)
    }
}

/// Serializes `err` and its causes. `visited` belongs to the caller and is
/// never modified; each level recurses with its own extended copy.
pub fn serialize_error(
    err: &(dyn Error + 'static),
    visited: &Visited,
    namer: ErrorNamer,
) -> ErrorDetails {
    let current: *const (dyn Error + 'static) = err;
    // The same object reached through two vtables is not caught by `ptr::eq`;
    // the depth limit still ends such a walk.
    if visited.len() >= MAX_CAUSE_DEPTH || visited.iter().any(|seen| ptr::eq(*seen, current)) {
        return ErrorDetails::cycle_detected();
    }

    let mut seen = visited.to_vec();
    seen.push(current);

    ErrorDetails {
        message: err.to_string(),
        name: Some(namer(err).unwrap_or(GENERIC_ERROR_NAME).to_string()),
        cause: err
            .source()
            .map(|cause| Box::new(serialize_error(cause, &seen, namer))),
    }
}
