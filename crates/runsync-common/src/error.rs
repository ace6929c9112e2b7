//! Error types shared by the runsync crates
//!
//! Cluster API failures are classified at the boundary so callers can branch
//! on the kind of failure instead of inspecting status codes: a missing object
//! becomes [`Error::NotFound`], an optimistic-concurrency rejection becomes
//! [`Error::Conflict`], everything else stays a [`Error::Kube`].

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for runsync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is neither a 404 nor a 409
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// The target object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (Job, Secret, RunJob)
        kind: String,
        /// Object name
        name: String,
    },

    /// The object changed since it was read, or already exists on create
    #[error("conflict on {kind} {name}: {message}")]
    Conflict {
        /// Resource kind (Job, Secret, RunJob)
        kind: String,
        /// Object name
        name: String,
        /// Message returned by the API server
        message: String,
    },

    /// A run carries input that cannot be turned into a Job
    #[error("validation error for run {run}: {message}")]
    Validation {
        /// Run id the invalid input belongs to
        run: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "resources.requests.cpu")
        field: Option<String>,
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
        /// Context where the error occurred (e.g., "reconciler", "startup")
        context: String,
    },
}

impl Error {
    /// Classify a kube-rs error for an object of the given kind and name
    pub fn from_kube(source: kube::Error, kind: impl Into<String>, name: impl Into<String>) -> Self {
        match &source {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound {
                kind: kind.into(),
                name: name.into(),
            },
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict {
                kind: kind.into(),
                name: name.into(),
                message: resp.message.clone(),
            },
            _ => Self::Kube { source },
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error without run context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            run: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a run and field path
    pub fn validation_for_field(
        run: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            run: run.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(msg: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when the object is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for optimistic-concurrency rejections and create races
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors will fail the same way on every
    /// attempt. Missing objects are an outcome, not a failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { .. } | Self::Conflict { .. } | Self::Internal { .. } => true,
            Self::NotFound { .. } | Self::Validation { .. } | Self::Serialization { .. } => false,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(source: kube::Error) -> Self {
        Self::from_kube(source, UNKNOWN_CONTEXT, UNKNOWN_CONTEXT)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
            kind: None,
        }
    }
}
