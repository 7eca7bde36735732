//! Error taxonomy for the run control plane.
//!
//! `RunError` is what callers of the control plane see. `RemoteError` is what a
//! worker process (or the registry it publishes into) reports back; it is folded
//! into `RunError` at the boundary.

use thiserror::Error;

use crate::run::Status;

#[derive(Debug, Clone, Error)]
pub enum RunError {
    #[error("Admission denied: {reason}")]
    AdmissionDenied { reason: String },
    /// Deliberately carries no hint of whether the run exists.
    #[error("No such run: {id}")]
    UnknownRun { id: String },
    #[error("Illegal status change from {from} to {to}")]
    IllegalTransition { from: Status, to: Status },
    #[error("Still working on {operation}; retry the same request")]
    StillWorking { operation: String },
    #[error("Worker connectivity failure: {message}")]
    ConnectivityFailure { message: String },
    #[error("Worker implementation failure: {message}")]
    ImplementationFailure { message: String },
    #[error("Invalid credential: {reason}")]
    InvalidCredential { reason: String },
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("Operation not permitted in current state: {reason}")]
    BadState { reason: String },
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

impl RunError {
    pub fn admission_denied(reason: impl Into<String>) -> Self {
        RunError::AdmissionDenied {
            reason: reason.into(),
        }
    }

    pub fn unknown_run(id: impl ToString) -> Self {
        RunError::UnknownRun { id: id.to_string() }
    }

    pub fn still_working(operation: impl Into<String>) -> Self {
        RunError::StillWorking {
            operation: operation.into(),
        }
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        RunError::ConnectivityFailure {
            message: message.into(),
        }
    }

    pub fn implementation(message: impl Into<String>) -> Self {
        RunError::ImplementationFailure {
            message: message.into(),
        }
    }

    pub fn invalid_credential(reason: impl Into<String>) -> Self {
        RunError::InvalidCredential {
            reason: reason.into(),
        }
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        RunError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn bad_state(reason: impl Into<String>) -> Self {
        RunError::BadState {
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        RunError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// The caller may resubmit the identical request and expect progress.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RunError::StillWorking { .. } | RunError::ConnectivityFailure { .. }
        )
    }

    /// `StillWorking` is a deferred result, not a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, RunError::StillWorking { .. })
    }
}

/// Faults reported across the worker boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("worker unreachable: {0}")]
    Unreachable(String),
    #[error("worker fault: {0}")]
    Fault(String),
}

impl RemoteError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RemoteError::Unreachable(_))
    }
}

impl From<RemoteError> for RunError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unreachable(message) => RunError::ConnectivityFailure { message },
            RemoteError::Fault(message) => RunError::ImplementationFailure { message },
        }
    }
}
