//! Pure classification of processing failures. Shared contract between the
//! worker (producer) and the retry endpoint (consumer); no side effects.

use crate::pipeline::{DocumentMetadata, ErrorCode};

/// Substrings that mark an error message as transient when the producer set
/// no explicit retryable flag. Matched against the lowercased message.
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "network",
    "rate_limit",
    "429",
    "503",
    "502",
    "econnreset",
    "etimedout",
];

/// True when the stored metadata describes a failure worth re-queueing.
pub fn is_retryable(metadata: &DocumentMetadata) -> bool {
    let Some(error) = metadata.processing_error.as_ref() else {
        return false;
    };

    if error.retryable {
        return true;
    }

    let message = error.message.to_lowercase();
    RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

pub fn user_message_for(code: ErrorCode, message: &str) -> String {
    let lowered = message.to_lowercase();
    match code {
        ErrorCode::Unauthorized | ErrorCode::ConfigurationMissing => {
            "The document service is misconfigured. Please contact support.".to_string()
        }
        ErrorCode::RateLimited => {
            "The processing service is handling too many requests right now.".to_string()
        }
        ErrorCode::Timeout => {
            "Processing took too long and was interrupted.".to_string()
        }
        ErrorCode::Network | ErrorCode::InvocationFailed => {
            "We could not reach the processing service.".to_string()
        }
        ErrorCode::UnsupportedFormat => {
            "This file format is not supported.".to_string()
        }
        ErrorCode::CorruptFile => {
            "The file could not be read. It may be damaged or encrypted.".to_string()
        }
        ErrorCode::Unknown => {
            if lowered.contains("api key") || lowered.contains("unauthorized") {
                "The document service is misconfigured. Please contact support.".to_string()
            } else if lowered.contains("rate limit") || lowered.contains("429") {
                "The processing service is handling too many requests right now.".to_string()
            } else if lowered.contains("timeout") {
                "Processing took too long and was interrupted.".to_string()
            } else {
                "Something went wrong while processing this document.".to_string()
            }
        }
    }
}

pub fn suggested_actions_for(code: ErrorCode, message: &str) -> Vec<String> {
    let lowered = message.to_lowercase();
    match code {
        ErrorCode::Unauthorized | ErrorCode::ConfigurationMissing => vec![
            "Contact your administrator".to_string(),
        ],
        ErrorCode::RateLimited => vec![
            "Wait a few minutes".to_string(),
            "Retry the document".to_string(),
        ],
        ErrorCode::Timeout | ErrorCode::Network | ErrorCode::InvocationFailed => vec![
            "Retry the document".to_string(),
            "Check your connection if the problem persists".to_string(),
        ],
        ErrorCode::UnsupportedFormat => vec![
            "Convert the file to PDF or plain text".to_string(),
            "Upload the converted file".to_string(),
        ],
        ErrorCode::CorruptFile => vec![
            "Re-export the file from its source application".to_string(),
            "Upload a different copy".to_string(),
        ],
        ErrorCode::Unknown => {
            if lowered.contains("rate limit") || lowered.contains("429") {
                vec![
                    "Wait a few minutes".to_string(),
                    "Retry the document".to_string(),
                ]
            } else if lowered.contains("timeout") {
                vec!["Retry the document".to_string()]
            } else {
                vec![
                    "Retry the document".to_string(),
                    "Contact support if the problem persists".to_string(),
                ]
            }
        }
    }
}
