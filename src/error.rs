//! Error types for matching, merging and scoring.
//!
//! Errors are classified by what a caller can do about them:
//! - Retryable: version conflicts between concurrent merges, store timeouts
//! - NonRetryable: validation failures, missing records, failed merge steps
//! - Degraded: a batch recompute finished but some contacts failed

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::db::DbError;
use crate::merge::MergeStep;

/// Failures of the store boundary (SQLite plus the async dispatch around it).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Store call `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("Store task failed: {0}")]
    Task(String),

    #[error("Merge step {step} failed: {source}")]
    MergeStep {
        step: MergeStep,
        #[source]
        source: DbError,
    },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::Db(DbError::Conflict(_))
                | StoreError::MergeStep {
                    source: DbError::Conflict(_),
                    ..
                }
        )
    }
}

/// Top-level error for every public operation.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Recompute degraded: {failed} of {total} contacts failed")]
    PartialFailure { failed: usize, total: usize },

    #[error("Merge of group {group_id} failed at {step}: {reason}")]
    MergeFailed {
        group_id: String,
        step: MergeStep,
        reason: String,
    },

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Db(DbError::Conflict(msg)) => CoreError::Conflict(msg),
            StoreError::Db(DbError::NotFound(what)) => CoreError::NotFound(what),
            other => CoreError::Store(other),
        }
    }
}

impl From<DbError> for CoreError {
    fn from(err: DbError) -> Self {
        CoreError::from(StoreError::Db(err))
    }
}

impl CoreError {
    /// Returns true if the same call may succeed when simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Conflict(_) | CoreError::Store(StoreError::Timeout { .. })
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::PartialFailure { .. } => ErrorKind::PartialFailure,
            CoreError::MergeFailed { .. } => ErrorKind::MergeFailed,
            CoreError::Store(_) => ErrorKind::Store,
        }
    }

    /// Get a short recovery suggestion for operators.
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "Fix the request and try again.",
            CoreError::NotFound(_) => "Check the organization and contact ids.",
            CoreError::Conflict(_) => {
                "Another merge touched these contacts. Re-run duplicate detection and retry."
            }
            CoreError::PartialFailure { .. } => {
                "Inspect the failed contact ids in the recompute summary and re-run."
            }
            CoreError::MergeFailed { .. } => {
                "The group was left unmerged. Investigate the failing step before retrying."
            }
            CoreError::Store(_) => "Check database availability and disk space.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    PartialFailure,
    MergeFailed,
    Store,
}

/// Serializable error representation for CLI / RPC callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub message: String,
    pub kind: ErrorKind,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

impl From<&CoreError> for ErrorReport {
    fn from(err: &CoreError) -> Self {
        ErrorReport {
            message: err.to_string(),
            kind: err.kind(),
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
