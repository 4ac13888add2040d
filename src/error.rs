//! Error types for the registration handshake

use std::time::Duration;

use thiserror::Error;

use crate::pki::PkiError;

/// Main error type for registration operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API or transport error that has no more specific mapping
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The resource store rejected a create
    #[error("submission of {kind} {name:?} rejected: {source}")]
    Submission {
        /// Kind of the object being created
        kind: String,
        /// Name (or generateName prefix) of the object
        name: String,
        /// Underlying store error
        #[source]
        source: Box<Error>,
    },

    /// Object does not exist
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Name of the missing object
        name: String,
    },

    /// Object already exists on create
    #[error("{kind} {name:?} already exists")]
    AlreadyExists {
        /// Kind of the existing object
        kind: String,
        /// Name of the existing object
        name: String,
    },

    /// Write rejected because the resource version was stale
    #[error("conflict writing {kind} {name:?}: object was modified")]
    Conflict {
        /// Kind of the object
        kind: String,
        /// Name of the object
        name: String,
    },

    /// Read-modify-write gave up after its attempt budget
    #[error("{operation}: gave up after {attempts} conflicting attempts")]
    ConflictExhausted {
        /// Operation that was being retried
        operation: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// A bounded poll reached its deadline
    #[error("timed out after {elapsed:?} waiting for {description} (last observed: {last_observed})")]
    Timeout {
        /// What was being waited for
        description: String,
        /// Time spent polling
        elapsed: Duration,
        /// Last state observed before giving up
        last_observed: String,
    },

    /// The hub denied the signing request
    #[error("signing request {name:?} denied: {reason}")]
    Denied {
        /// Signing request name
        name: String,
        /// Reason recorded on the Denied condition
        reason: String,
    },

    /// Bootstrap credential is missing or malformed
    #[error("bootstrap credential error: {0}")]
    Credential(String),

    /// Validation error for inputs and objects
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Key, CSR or certificate handling failed
    #[error("PKI error: {0}")]
    Pki(#[from] PkiError),
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Wrap a store error as a rejected submission
    pub fn submission(kind: impl Into<String>, name: impl Into<String>, source: Error) -> Self {
        Self::Submission {
            kind: kind.into(),
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Create a credential error with the given message
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True if the write lost an optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True if the object did not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True if a poll loop may retry after this error.
    ///
    /// Not-found and conflicts are expected while other actors converge.
    /// Transport failures and server-side 5xx/429 responses are assumed to
    /// recover. Everything else (forbidden, invalid, denied) is terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::Conflict { .. } => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            Self::Kube(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
