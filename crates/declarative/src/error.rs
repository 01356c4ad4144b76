//! Error types for reconciliation.
//!
//! Errors are categorized so the executor can decide what to retry and the
//! caller can decide whether it must re-read live state before continuing.

use crate::types::{LiveState, OperationKind, ResourceIdentity};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Categories of reconciliation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Desired config rejected before any remote call
    Validation,
    /// Transient remote failure (retryable)
    Transient,
    /// Live state changed since it was last read
    Conflict,
    /// Resource does not exist remotely
    NotFound,
    /// Remote side effect unknown; caller must re-read
    Indeterminate,
    /// Caller cancelled or the deadline passed
    Cancelled,
    /// Terminal failure reported by the remote
    Failed,
    /// Local bookkeeping failure (registry, store)
    Local,
}

impl ErrorCategory {
    /// Whether this category is worth retrying automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Whether the caller has to fetch live state before trusting local state.
    pub fn requires_refresh(&self) -> bool {
        matches!(self, Self::Conflict | Self::Indeterminate | Self::Cancelled)
    }

    /// Short user-facing description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Validation => "Invalid configuration",
            Self::Transient => "Transient remote failure",
            Self::Conflict => "Concurrent modification",
            Self::NotFound => "Resource not found",
            Self::Indeterminate => "Remote outcome unknown",
            Self::Cancelled => "Cancelled",
            Self::Failed => "Remote operation failed",
            Self::Local => "Local error",
        }
    }
}

/// Desired-config problems caught before execution. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown field `{field}` for {resource_type}")]
    UnknownField { resource_type: String, field: String },

    #[error("only one of `{}` may be set in group `{group}`", fields.join(", "))]
    ExclusiveFieldConflict { group: String, fields: Vec<String> },

    #[error("one of the fields in group `{group}` must be specified")]
    MissingRequiredField { group: String },

    #[error("required field `{field}` is missing")]
    MissingField { field: String },

    #[error("unit mismatch in `{field}`: {detail}")]
    UnitMismatch { field: String, detail: String },

    #[error("invalid schedule: {reason}")]
    InvalidSchedule { reason: String },

    #[error("invalid value for `{field}`: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("cannot change immutable field(s) `{}` after creation", fields.join(", "))]
    ImmutableFieldChanged { fields: Vec<String> },
}

impl ValidationError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFieldValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Problems in a schema declaration, caught at registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("{resource_type}: group `{group}` names undeclared field `{field}`")]
    UndeclaredMember {
        resource_type: String,
        group: String,
        field: String,
    },

    #[error("{resource_type}: field `{field}` declares a default but belongs to group `{group}`")]
    GroupMemberDefault {
        resource_type: String,
        group: String,
        field: String,
    },

    #[error("{resource_type}: implicit default `{field}` is not a member of group `{group}`")]
    ImplicitDefaultOutsideGroup {
        resource_type: String,
        group: String,
        field: String,
    },

    #[error("{resource_type}: local-only field `{field}` cannot be immutable or grouped")]
    LocalOnlyConstraint { resource_type: String, field: String },

    #[error("{resource_type}: field `{field}` declared twice")]
    DuplicateField { resource_type: String, field: String },
}

/// Remote failure kinds reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Timeouts, 5xx equivalents, throttling
    Transient,
    NotFound,
    AlreadyExists,
    /// Precondition (fingerprint) mismatch
    Conflict,
    FailedPrecondition,
    Permanent,
}

/// Error returned by a [`Transport`](crate::transport::Transport) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RemoteErrorKind::Transient
    }
}

/// Why an operation stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Requested,
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "cancellation requested"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Terminal remote failure, or transient retries exhausted.
    ///
    /// For updates `refreshed` holds the live state fetched after the
    /// failure, since part of the patch may have been applied.
    #[error("operation on {target} failed after {attempts} attempt(s): {cause}")]
    OperationFailed {
        target: String,
        attempts: u32,
        cause: RemoteError,
        refreshed: Option<Box<LiveState>>,
    },

    #[error("{identity} changed remotely since it was last read")]
    Conflict { identity: ResourceIdentity },

    #[error("{0} not found")]
    NotFound(ResourceIdentity),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{target}: {reason}; re-read live state before retrying")]
    Cancelled { target: String, reason: CancelReason },

    #[error("{target}: remote outcome unknown ({detail}); re-read live state")]
    IndeterminateState { target: String, detail: String },

    #[error("{kind} is not valid for {target}")]
    InvalidOperation { kind: OperationKind, target: String },

    #[error("state store {path}: {message}")]
    Storage { path: PathBuf, message: String },
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_) => ErrorCategory::Validation,
            Error::OperationFailed { cause, .. } if cause.is_transient() => {
                ErrorCategory::Transient
            }
            Error::OperationFailed { .. } | Error::AlreadyExists(_) => ErrorCategory::Failed,
            Error::Conflict { .. } => ErrorCategory::Conflict,
            Error::NotFound(_) => ErrorCategory::NotFound,
            Error::Cancelled { .. } => ErrorCategory::Cancelled,
            Error::IndeterminateState { .. } => ErrorCategory::Indeterminate,
            Error::UnknownResourceType(_)
            | Error::Schema(_)
            | Error::InvalidOperation { .. }
            | Error::Storage { .. } => ErrorCategory::Local,
        }
    }

    /// Whether this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// The validation error, if this is one.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Error::Validation(v) => Some(v),
            _ => None,
        }
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;
