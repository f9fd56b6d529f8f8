//! # Change-Control Error Types
//!
//! Errors returned by the change-control plane. Only conditions that abort a
//! whole request are modelled here; expected partial outcomes (skipped hunks,
//! fuzzy offsets, divergence, per-op policy rejections) travel in the
//! `warnings` / `errors` arrays of each result instead.
//!
//! ## Error Categories
//!
//! - **Validation**: malformed request or diff
//! - **Security**: path policy violations
//! - **Concurrency**: a mutation of the same class is already running
//! - **State**: referenced changeset or file does not exist
//! - **Resource / System**: size caps, I/O and internal failures

use std::borrow::Cow;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorCategory {
    /// Input validation failures and malformed data
    Validation,
    /// Path policy violations
    Security,
    /// Guard already held by another request
    Concurrency,
    /// Missing changesets, files or other referenced state
    State,
    /// Size caps
    Resource,
    /// I/O and internal failures
    System,
}

/// Result type for all change-control operations.
pub type VibeResult<T> = Result<T, VibeError>;

#[derive(Debug, Error)]
pub enum VibeError {
    /// E_INVALID_DIFF - the diff contained nothing applicable
    #[error("Invalid diff: {reason}")]
    InvalidDiff {
        reason: String,
        /// Line number where parsing gave up (if applicable)
        line_number: Option<usize>,
    },

    /// E_VALIDATION - a request field is missing or malformed
    #[error("Invalid request field '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// E_PROTECTED_PATH - the path is outside the workspace or matches a
    /// blocked segment
    #[error("Access denied to protected path: {}", path.display())]
    ProtectedPath {
        path: PathBuf,
        /// Rule that rejected the path
        protection_rule: String,
        attempted_operation: String,
    },

    /// E_RESOURCE_LIMIT - content or request exceeds a configured cap
    #[error("Resource limit exceeded: {resource_type} ({current_usage} > {limit} {unit})")]
    ResourceLimit {
        resource_type: String,
        current_usage: u64,
        limit: u64,
        unit: String,
    },

    /// E_BUSY - another mutation of the same class holds the guard
    ///
    /// Callers are expected to back off and retry.
    #[error("{operation} in progress, try again")]
    Busy { operation: String },

    /// E_NOT_FOUND - referenced changeset or file does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// E_IO - I/O operation failed
    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    /// E_INTERNAL - unexpected failure
    #[error("Internal error in {component}: {message}")]
    Internal {
        component: String,
        message: String,
        cause: Option<String>,
        /// Correlation ID for log lookup
        correlation_id: String,
    },
}

impl VibeError {
    pub fn io<P, S>(path: P, operation: S, source: std::io::Error) -> Self
    where
        P: Into<Option<PathBuf>>,
        S: Into<String>,
    {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    pub fn internal<M: Into<Cow<'static, str>>>(message: M) -> Self {
        VibeError::Internal {
            component: "core".to_string(),
            message: message.into().into_owned(),
            cause: None,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        VibeError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        VibeError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn protected(
        path: impl Into<PathBuf>,
        rule: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        VibeError::ProtectedPath {
            path: path.into(),
            protection_rule: rule.into(),
            attempted_operation: operation.into(),
        }
    }

    /// Returns the error code for this error variant.
    pub fn error_code(&self) -> &'static str {
        match self {
            VibeError::InvalidDiff { .. } => "E_INVALID_DIFF",
            VibeError::Validation { .. } => "E_VALIDATION",
            VibeError::ProtectedPath { .. } => "E_PROTECTED_PATH",
            VibeError::ResourceLimit { .. } => "E_RESOURCE_LIMIT",
            VibeError::Busy { .. } => "E_BUSY",
            VibeError::NotFound { .. } => "E_NOT_FOUND",
            VibeError::Io { .. } => "E_IO",
            VibeError::Internal { .. } => "E_INTERNAL",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            VibeError::InvalidDiff { .. } | VibeError::Validation { .. } => {
                ErrorCategory::Validation
            }
            VibeError::ProtectedPath { .. } => ErrorCategory::Security,
            VibeError::ResourceLimit { .. } => ErrorCategory::Resource,
            VibeError::Busy { .. } => ErrorCategory::Concurrency,
            VibeError::NotFound { .. } => ErrorCategory::State,
            VibeError::Io { .. } | VibeError::Internal { .. } => ErrorCategory::System,
        }
    }

    /// Only a held guard is worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VibeError::Busy { .. })
    }

    pub fn recovery_hint(&self) -> Option<String> {
        match self {
            VibeError::InvalidDiff { .. } => Some(
                "Send a unified diff with '--- a/<path>' / '+++ b/<path>' headers and '@@' hunks"
                    .to_string(),
            ),
            VibeError::Busy { .. } => Some("Retry after a short backoff".to_string()),
            VibeError::ProtectedPath {
                protection_rule, ..
            } => Some(format!(
                "Choose a path inside the workspace that is not blocked by '{}'",
                protection_rule
            )),
            VibeError::ResourceLimit { limit, unit, .. } => {
                Some(format!("Keep the payload under {} {}", limit, unit))
            }
            VibeError::Internal { correlation_id, .. } => Some(format!(
                "Check the server logs for correlation id {}",
                correlation_id
            )),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for VibeError {
    fn from(error: anyhow::Error) -> Self {
        VibeError::Internal {
            component: "core".to_string(),
            message: error.to_string(),
            cause: error.chain().nth(1).map(|source| source.to_string()),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }
}
