//! Error types for the LRO engine.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::operation::OperationKind;

/// Errors returned by provider calls (issuers and handlers).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The resource does not exist on the provider side.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with the current provider state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The call was aborted because the reconciliation deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The provider rejected the request.
    #[error("request rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    /// The provider could not be reached or returned a transport failure.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The operation finished on the provider side but did not succeed.
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Error computing desired parameters from a resource spec.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SpecError(pub String);

impl SpecError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Errors encoding or decoding a persisted poller token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid token payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported token version {0}")]
    UnsupportedVersion(u32),
}

/// A provider-side operation has been accepted but has not completed yet.
///
/// This is not a failure: callers requeue the owning object after `requeue_after`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationNotDone {
    pub kind: OperationKind,
    pub resource_group: String,
    pub resource_name: String,
    pub requeue_after: Duration,
}

impl fmt::Display for OperationNotDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation type {} on resource {}/{} is not done. Object will be requeued after {}s",
            self.kind,
            self.resource_group,
            self.resource_name,
            self.requeue_after.as_secs()
        )
    }
}

/// Errors returned by the reconciler.
///
/// Every variant except [`ReconcileError::OperationNotDone`] is fatal for the current
/// attempt. The provider error is kept as `source()` and also rendered into the message
/// so a single log line is actionable.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{0}")]
    OperationNotDone(OperationNotDone),

    #[error(
        "failed checking if the operation was complete for {kind} on {resource_group}/{resource_name} (service: {service}): {source}"
    )]
    CheckCompletion {
        kind: OperationKind,
        resource_group: String,
        resource_name: String,
        service: String,
        #[source]
        source: ProviderError,
    },

    #[error(
        "failed to get result of {kind} operation on {resource_group}/{resource_name} (service: {service}): {source}"
    )]
    FetchResult {
        kind: OperationKind,
        resource_group: String,
        resource_name: String,
        service: String,
        #[source]
        source: ProviderError,
    },

    #[error(
        "failed to get existing resource {resource_group}/{resource_name} (service: {service}): {source}"
    )]
    GetExisting {
        resource_group: String,
        resource_name: String,
        service: String,
        #[source]
        source: ProviderError,
    },

    #[error(
        "failed to get desired parameters for resource {resource_group}/{resource_name} (service: {service}): {source}"
    )]
    Parameters {
        resource_group: String,
        resource_name: String,
        service: String,
        #[source]
        source: SpecError,
    },

    #[error(
        "failed to create resource {resource_group}/{resource_name} (service: {service}): {source}"
    )]
    Create {
        resource_group: String,
        resource_name: String,
        service: String,
        #[source]
        source: ProviderError,
    },

    #[error(
        "failed to delete resource {resource_group}/{resource_name} (service: {service}): {source}"
    )]
    Delete {
        resource_group: String,
        resource_name: String,
        service: String,
        #[source]
        source: ProviderError,
    },

    #[error(
        "failed to encode {kind} operation state for {resource_group}/{resource_name} (service: {service}): {source}"
    )]
    EncodeToken {
        kind: OperationKind,
        resource_group: String,
        resource_name: String,
        service: String,
        #[source]
        source: TokenError,
    },
}

impl ReconcileError {
    /// True if this is the "still in progress" outcome rather than a failure.
    pub fn is_operation_not_done(&self) -> bool {
        matches!(self, ReconcileError::OperationNotDone(_))
    }

    /// Suggested requeue delay, only present for [`ReconcileError::OperationNotDone`].
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            ReconcileError::OperationNotDone(not_done) => Some(not_done.requeue_after),
            _ => None,
        }
    }

    pub fn as_operation_not_done(&self) -> Option<&OperationNotDone> {
        match self {
            ReconcileError::OperationNotDone(not_done) => Some(not_done),
            _ => None,
        }
    }
}

impl From<OperationNotDone> for ReconcileError {
    fn from(not_done: OperationNotDone) -> Self {
        ReconcileError::OperationNotDone(not_done)
    }
}

/// Result type for reconciler operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;
