//! Error types for the exportd control plane.
//!
//! Errors carry enough context to decide whether a reconciliation should be
//! retried with backoff (transient orchestrator or driver trouble) or parked
//! until the user fixes their objects (validation).

use thiserror::Error;

/// Prefix of status messages that record an orchestrator-side write failure.
/// Messages carrying this prefix are deduplicated when mirrored upstream.
pub const UPDATE_FAIL_PREFIX: &str = "export controller failed to update";

/// Main error type for exportd operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error.
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An object failed a validation rule; requires a user fix.
    #[error("validation error: {message}")]
    Validation {
        /// Description of what is invalid
        message: String,
    },

    /// A write to the API server failed after the side effect may already
    /// have happened. The Display form carries [`UPDATE_FAIL_PREFIX`].
    #[error("{UPDATE_FAIL_PREFIX} {object} on API server: {message}")]
    ApiUpdate {
        /// Name of the object whose write failed
        object: String,
        /// Underlying failure
        message: String,
    },

    /// The storage driver rejected or failed an RPC.
    #[error("driver error for {object}: {message}")]
    Driver {
        /// Name of the content the RPC was issued for
        object: String,
        /// Description of what failed
        message: String,
        /// Whether the driver proved the RPC is no longer in flight
        final_error: bool,
    },

    /// Credentials could not be resolved or fetched.
    #[error("secret error: {message}")]
    Secrets {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error.
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred (e.g. "queue", "store", "watcher")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an API-update error for the given object.
    pub fn api_update(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ApiUpdate {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create a driver error the driver has proven final.
    pub fn driver_final(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Driver {
            object: object.into(),
            message: msg.into(),
            final_error: true,
        }
    }

    /// Create a driver error whose RPC may still be in flight.
    pub fn driver_transient(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Driver {
            object: object.into(),
            message: msg.into(),
            final_error: false,
        }
    }

    /// Create a secrets error.
    pub fn secrets(msg: impl Into<String>) -> Self {
        Self::Secrets {
            message: msg.into(),
        }
    }

    /// Create an internal error with context.
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Whether a reconciliation hitting this error should be retried with
    /// backoff. Validation errors are not retried; the next informer event
    /// re-drives them naturally.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Validation { .. } => false,
            Error::ApiUpdate { .. } => true,
            Error::Driver { .. } => true,
            Error::Secrets { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this is a resource-version conflict from the API server.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409 && ae.reason == "Conflict")
    }

    /// Whether this is an AlreadyExists rejection from the API server.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.reason == "AlreadyExists")
    }
}

/// Whether a status error message records an orchestrator write failure.
pub fn is_update_fail_message(message: &str) -> bool {
    message.starts_with(UPDATE_FAIL_PREFIX)
}
