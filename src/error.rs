//! Error types for the KVM operator
//!
//! Errors carry enough context (cluster, resource) to be actionable from logs.
//! Controllers classify them with [`Error::is_not_found`] and
//! [`Error::is_conflict`] before deciding whether to escalate.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for KVM operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for custom resource specs
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Cluster with the invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// A management object lacks a label the operator relies on
    #[error("{kind} {name} is missing label {label}")]
    MissingLabel {
        /// Kind of the object (e.g., "Pod")
        kind: String,
        /// namespace/name of the object
        name: String,
        /// The missing label key
        label: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The workload cluster client could not be built
    #[error("workload client error for {cluster}: {message}")]
    WorkloadClient {
        /// Workload cluster ID
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "supervisor", "drain")
        context: String,
    },
}

impl Error {
    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a missing-label error
    pub fn missing_label(
        kind: impl Into<String>,
        name: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self::MissingLabel {
            kind: kind.into(),
            name: name.into(),
            label: label.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a workload client error for a cluster
    pub fn workload_client(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::WorkloadClient {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
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

    /// HTTP status code of the underlying API error, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Self::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// True when the API server answered 404
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// True when the API server rejected a write with 409 (stale resourceVersion)
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }
}

/// Build a kube API error with the given status code
///
/// Lets tests and mocks produce errors that classify exactly like the ones
/// returned by a real API server.
pub fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    }))
}
