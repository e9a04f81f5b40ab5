//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

use crate::quota::QuotaError;

/// Requeue delay for blocking preconditions.
pub const BLOCKING_REQUEUE: Duration = Duration::from_secs(5);

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Object does not exist
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Object already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// A process named by the caller is not declared by the app
    #[error("process {0} not found")]
    ProcessNotFound(String),

    /// Invalid resource quota
    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    /// The previous deploy's hook has not finished yet
    #[error("hook of the previous deploy {0} is still running")]
    LastHookStillRunning(String),

    /// A hook pod for this deploy already exists
    #[error("hook pod {0} already exists")]
    HookPodExists(String),

    /// Hook execution exceeded its threshold
    #[error("hook timed out: {0}")]
    HookTimeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reconcile pass exceeded its deadline
    #[error("reconcile timed out after {0:?}")]
    Timeout(Duration),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
            || matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error indicates an already-exists conflict
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
            || matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// User-fixable problems that only a spec change can resolve
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::ProcessNotFound(_) | Error::Quota(_)
        )
    }

    /// Preconditions expected to clear on their own shortly
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Error::LastHookStillRunning(_) | Error::HookPodExists(_)
        )
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Transient(_) | Error::Timeout(_) | Error::NotFound { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::LastHookStillRunning(_) | Error::HookPodExists(_) => true,
            Error::Validation(_)
            | Error::ProcessNotFound(_)
            | Error::Quota(_)
            | Error::HookTimeout(_)
            | Error::Permanent(_)
            | Error::Serialization(_) => false,
        }
    }

    /// Failure category used as a metrics label
    pub fn category(&self) -> &'static str {
        match self {
            Error::Kube(_) | Error::NotFound { .. } | Error::AlreadyExists { .. } => "kube",
            Error::Validation(_) | Error::ProcessNotFound(_) | Error::Quota(_) => "validation",
            Error::LastHookStillRunning(_) | Error::HookPodExists(_) => "blocking",
            Error::HookTimeout(_) => "hook_timeout",
            Error::Serialization(_) => "serialization",
            Error::Timeout(_) => "timeout",
            Error::Transient(_) => "transient",
            Error::Permanent(_) => "permanent",
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Option<Duration> {
        if self.is_blocking() {
            Some(BLOCKING_REQUEUE)
        } else if self.is_retryable() {
            Some(Duration::from_secs(30))
        } else {
            None
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
