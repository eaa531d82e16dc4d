//! Error handling module for the sync core.
//!
//! Provides the error taxonomy surfaced to callers of repositories and the
//! reconciliation engine, with stable string codes for the UI layer.

use serde::{Deserialize, Serialize};

/// Error codes as constants to avoid stringly-typed errors.
pub mod codes {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const REMOTE_UNAVAILABLE: &str = "REMOTE_UNAVAILABLE";
    pub const STORAGE_UNAVAILABLE: &str = "STORAGE_UNAVAILABLE";
    pub const RECONCILIATION_PARTIAL_FAILURE: &str = "RECONCILIATION_PARTIAL_FAILURE";
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
}

/// A single record that could not be replayed during a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFailure {
    /// Store the record lives in (`tasks`, `routines`, ...)
    pub store: String,
    pub record_id: String,
    /// Replay phase that failed (`delete`, `create`, `update`, `activation`, `slot`)
    pub phase: String,
    pub message: String,
}

/// Sync core error type.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Operation on an id that is not present
    NotFound(String),
    /// Required input fields are missing
    Validation(String),
    /// Network or server failure while online
    RemoteUnavailable(String),
    /// Local store is inaccessible
    StorageUnavailable(String),
    /// Aggregate of per-record failures from a reconciliation pass.
    /// Returned inside pass reports, never propagated with `?`.
    ReconciliationPartialFailure { failures: Vec<RecordFailure> },
    /// Invalid configuration value
    Config(String),
}

impl SyncError {
    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::NotFound(_) => codes::NOT_FOUND,
            SyncError::Validation(_) => codes::VALIDATION_ERROR,
            SyncError::RemoteUnavailable(_) => codes::REMOTE_UNAVAILABLE,
            SyncError::StorageUnavailable(_) => codes::STORAGE_UNAVAILABLE,
            SyncError::ReconciliationPartialFailure { .. } => codes::RECONCILIATION_PARTIAL_FAILURE,
            SyncError::Config(_) => codes::CONFIG_ERROR,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            SyncError::NotFound(msg) => msg.clone(),
            SyncError::Validation(msg) => msg.clone(),
            SyncError::RemoteUnavailable(msg) => msg.clone(),
            SyncError::StorageUnavailable(msg) => msg.clone(),
            SyncError::ReconciliationPartialFailure { failures } => {
                format!("{} item(s) failed to sync", failures.len())
            }
            SyncError::Config(msg) => msg.clone(),
        }
    }

    /// Caller errors are surfaced immediately and never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, SyncError::NotFound(_) | SyncError::Validation(_))
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for SyncError {}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Local store error: {:?}", err);
        SyncError::StorageUnavailable(format!("Local store error: {}", err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("Record encoding error: {:?}", err);
        SyncError::StorageUnavailable(format!("Record encoding error: {}", err))
    }
}
