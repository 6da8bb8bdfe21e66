//! Document ingestion lifecycle: status state machine and the typed
//! `metadata` payload shared with the external processing worker.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Queued,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Queued => STATUS_QUEUED,
            DocumentStatus::Processing => STATUS_PROCESSING,
            DocumentStatus::Completed => STATUS_COMPLETED,
            DocumentStatus::Error => STATUS_ERROR,
            DocumentStatus::Cancelled => STATUS_CANCELLED,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            STATUS_QUEUED => Some(DocumentStatus::Queued),
            STATUS_PROCESSING => Some(DocumentStatus::Processing),
            STATUS_COMPLETED => Some(DocumentStatus::Completed),
            STATUS_ERROR => Some(DocumentStatus::Error),
            STATUS_CANCELLED => Some(DocumentStatus::Cancelled),
            _ => None,
        }
    }

    /// Forward-only transitions. `error -> queued` is reserved for the
    /// explicit retry operation and is rejected here.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Error)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Error)
                | (Processing, Cancelled)
        )
    }
}

#[derive(Debug, Error)]
#[error("invalid document status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}

pub fn check_transition(
    from: DocumentStatus,
    to: DocumentStatus,
) -> Result<(), InvalidTransition> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// Error codes shared between the processing worker (producer) and the
/// retry service (consumer). Producers should always set one; the substring
/// vocabulary in `classify` exists only as a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvocationFailed,
    Timeout,
    Network,
    RateLimited,
    Unauthorized,
    UnsupportedFormat,
    CorruptFile,
    ConfigurationMissing,
    Unknown,
}

impl ErrorCode {
    /// Codes from newer or third-party producers degrade to `Unknown`
    /// instead of failing the whole metadata parse.
    pub fn parse(value: &str) -> Self {
        match value {
            "invocation_failed" => ErrorCode::InvocationFailed,
            "timeout" => ErrorCode::Timeout,
            "network" => ErrorCode::Network,
            "rate_limited" => ErrorCode::RateLimited,
            "unauthorized" => ErrorCode::Unauthorized,
            "unsupported_format" => ErrorCode::UnsupportedFormat,
            "corrupt_file" => ErrorCode::CorruptFile,
            "configuration_missing" => ErrorCode::ConfigurationMissing,
            _ => ErrorCode::Unknown,
        }
    }

    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::InvocationFailed
                | ErrorCode::Timeout
                | ErrorCode::Network
                | ErrorCode::RateLimited
        )
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(ErrorCode::parse(&value))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingError {
    pub code: ErrorCode,
    pub message: String,
    pub user_message: String,
    pub suggested_actions: Vec<String>,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

impl ProcessingError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            user_message: crate::classify::user_message_for(code, &message),
            suggested_actions: crate::classify::suggested_actions_for(code, &message),
            retryable: code.default_retryable(),
            timestamp: Utc::now(),
            code,
            message,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingProgress {
    pub stage: String,
    pub percentage: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedded_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// The `documents.metadata` jsonb column. Unknown keys written by other
/// producers are preserved via `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_progress: Option<ProcessingProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_error: Option<ProcessingError>,
    #[serde(default)]
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DocumentMetadata {
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Deterministic storage key for an upload. Inserted on the document row
/// before any bytes hit the object store, so a crash mid-upload leaves a
/// recoverable queued row instead of an orphan blob.
pub fn storage_key(uploader: Uuid, uploaded_at: NaiveDateTime, original_name: &str) -> String {
    format!(
        "documents/{}/{}-{}",
        uploader,
        uploaded_at.and_utc().timestamp_millis(),
        sanitize_filename(original_name)
    )
}

pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Bucket per owning organisation.
pub fn bucket_for_organisation(prefix: &str, organisation_id: Uuid) -> String {
    format!("{prefix}-{organisation_id}")
}
