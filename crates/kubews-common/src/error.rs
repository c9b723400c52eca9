//! Error types for kubews
//!
//! Errors carry structured fields so a failed workspace start can be diagnosed
//! from logs alone: which resource, which namespace, which port range.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Prefix shared by every workspace configuration validation message
pub const INVALID_CONFIGURATION_PREFIX: &str = "Workspace configuration not valid";

/// Main error type for kubews operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The workspace configuration is invalid; the start cannot proceed
    #[error("{INVALID_CONFIGURATION_PREFIX}: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// A provisioning step failed against the infrastructure
    #[error("infrastructure error [{context}]: {message}")]
    Infrastructure {
        /// Description of what failed
        message: String,
        /// Step or resource the failure belongs to
        context: String,
    },

    /// No port left in the configured range
    #[error("no available port in configured range [{min}, {max})")]
    PortRangeExhausted {
        /// Inclusive lower bound
        min: u16,
        /// Exclusive upper bound
        max: u16,
    },

    /// Deletion was issued but not observed before the wait bound elapsed
    #[error("{resource} removal timeout reached after {seconds}s (last observed state: {last_state})")]
    DeleteTimeout {
        /// `kind/namespace/name` of the object being removed
        resource: String,
        /// The wait bound in seconds
        seconds: u64,
        /// Last state reported by the watch before giving up
        last_state: String,
    },

    /// The task waiting for the deletion was cancelled
    #[error("waiting for {resource} removal was interrupted")]
    DeleteInterrupted {
        /// `kind/namespace/name` of the object being removed
        resource: String,
    },

    /// Deletion could not be confirmed
    #[error("{resource} removal failed: {message}")]
    DeleteFailed {
        /// `kind/namespace/name` of the object being removed
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// An external store (preferences, users, ssh keys) failed
    #[error("store error [{store}]: {message}")]
    Store {
        /// Which store failed
        store: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a workspace configuration validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an infrastructure error with step context
    pub fn infrastructure(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Infrastructure {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a port exhaustion error for the given range
    pub fn port_range_exhausted(min: u16, max: u16) -> Self {
        Self::PortRangeExhausted { min, max }
    }

    /// Create a delete timeout error
    pub fn delete_timeout(
        resource: impl Into<String>,
        timeout: Duration,
        last_state: impl Into<String>,
    ) -> Self {
        Self::DeleteTimeout {
            resource: resource.into(),
            seconds: timeout.as_secs(),
            last_state: last_state.into(),
        }
    }

    /// Create a delete interrupted error
    pub fn delete_interrupted(resource: impl Into<String>) -> Self {
        Self::DeleteInterrupted {
            resource: resource.into(),
        }
    }

    /// Create a delete failed error
    pub fn delete_failed(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DeleteFailed {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a store error
    pub fn store(store: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            store: store.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the error came from a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Whether the error came from a Kubernetes 409 (object already exists)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Whether retrying the call may succeed: transport failures, throttling
    /// and server-side errors
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 429 || ae.code >= 500,
            Self::Kube { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
