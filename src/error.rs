// src/error.rs

//! Unified error handling for the monitor.
//!
//! `AppError` is the crate-wide error. The pipeline components have their
//! own narrower enums (`FetchError`, `StorageError`, `DeliveryError`) so a
//! cycle can decide per failure whether to retry, skip, or report, and
//! each of them maps onto an operator-facing [`ErrorKind`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for monitor operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Regex compilation failed
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Target lookup failed
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// Content acquisition failed
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// History store failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Notification delivery failed
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl AppError {
    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Failure to acquire raw content for a target.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Retryable failures (timeouts, 5xx, 429) persisted past the retry budget.
    #[error("transient fetch failure after {attempts} attempt(s): {reason}")]
    Transient { attempts: u32, reason: String },

    /// The target cannot be fetched as configured (4xx, unreachable host, bad URL).
    #[error("permanent fetch failure: {reason}")]
    Permanent { reason: String },
}

impl FetchError {
    pub fn transient(attempts: u32, reason: impl fmt::Display) -> Self {
        Self::Transient {
            attempts,
            reason: reason.to_string(),
        }
    }

    pub fn permanent(reason: impl fmt::Display) -> Self {
        Self::Permanent {
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::TransientFetch,
            Self::Permanent { .. } => ErrorKind::PermanentFetch,
        }
    }
}

/// History store failure. Always fatal to the current cycle only.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encoding error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The append does not follow the latest stored snapshot.
    #[error(
        "out-of-order append for {target_id}: expected seq {expected_seq} after {latest_fetched_at}, got seq {seq}"
    )]
    OutOfOrder {
        target_id: String,
        expected_seq: u64,
        seq: u64,
        latest_fetched_at: String,
    },

    /// A change record that does not lead to the snapshot it is stored with.
    #[error("inconsistent history entry: {0}")]
    Inconsistent(String),

    #[error("storage operation timed out after {0}s")]
    Timeout(u64),
}

/// Per-channel delivery failure, as reported by a [`Channel`](crate::services::Channel).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("retryable delivery error: {0}")]
    Retryable(String),

    #[error("permanent delivery error: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Operator-facing error taxonomy.
///
/// Only the kind and a short reason leave the component where the error
/// happened; the full error stays in that component's log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientFetch,
    PermanentFetch,
    Normalization,
    Storage,
    Delivery,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientFetch => "transient_fetch",
            ErrorKind::PermanentFetch => "permanent_fetch",
            ErrorKind::Normalization => "normalization",
            ErrorKind::Storage => "storage",
            ErrorKind::Delivery => "delivery",
        }
    }

    /// Stable human-readable reason shown in status reports.
    pub fn reason(&self) -> &'static str {
        match self {
            ErrorKind::TransientFetch => "fetch failed after retries; will retry next cycle",
            ErrorKind::PermanentFetch => "fetch rejected or target unreachable; check target",
            ErrorKind::Normalization => "field extraction failed",
            ErrorKind::Storage => "history store write failed; nothing recorded",
            ErrorKind::Delivery => "alert delivery failed on one or more channels",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
