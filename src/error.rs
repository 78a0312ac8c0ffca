//! Error taxonomy
//!
//! Lifecycle precondition violations, per-item validation failures,
//! store failures and aggregated replication failures. Resolution
//! misses are not errors: the resolver answers `None`.
//!
//! Author: Moroya Sakamoto

use thiserror::Error;

use crate::change::ChangeEvent;

/// Failure reported by the backing content store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No node at the given path
    #[error("no node at {0}")]
    NotFound(String),
    /// A node already occupies the given path
    #[error("node already exists at {0}")]
    AlreadyExists(String),
    /// Operation requires a versionable node
    #[error("node at {0} is not versionable")]
    NotVersionable(String),
    /// Unknown snapshot
    #[error("unknown version {0}")]
    VersionNotFound(String),
    /// Malformed argument or inconsistent store state
    #[error("invalid store operation: {0}")]
    Invalid(String),
}

/// Error raised by a replication listener.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned by registry and change-event operations.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("release {number} not found below {root}")]
    ReleaseNotFound { root: String, number: String },

    #[error("release {number} already exists below {root}")]
    ReleaseExists { root: String, number: String },

    #[error("release {0} is closed")]
    ReleaseClosed(String),

    /// Release still carries marks and cannot be deleted
    #[error("release {number} is protected by marks {marks:?}")]
    ReleaseProtected { number: String, marks: Vec<String> },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("change event is finalized and cannot be modified")]
    EventFinalized,

    #[error(transparent)]
    Store(#[from] StoreError),

    /// One or more replication listeners failed.
    ///
    /// `source` is the first failure, `suppressed` the rest. The event is
    /// kept so the caller can retry or force a full check.
    #[error("{message}")]
    ReplicationFailed {
        message: String,
        #[source]
        source: ListenerError,
        suppressed: Vec<ListenerError>,
        event: Box<ChangeEvent>,
    },
}

impl ReleaseError {
    /// Shorthand for a validation failure
    pub fn validation(msg: impl Into<String>) -> Self {
        ReleaseError::Validation(msg.into())
    }

    /// True for errors that abort only the offending item of a batch.
    pub fn is_per_item(&self) -> bool {
        matches!(self, ReleaseError::Validation(_))
    }
}

/// Result alias for registry operations
pub type Result<T> = std::result::Result<T, ReleaseError>;

/// Result alias for store primitives
pub type StoreResult<T> = std::result::Result<T, StoreError>;
