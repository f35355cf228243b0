//! Error types for the flush engine.

use relsync_model::{Entity, EntityKey, EntityType, ModelError, ValidationErrors};
use thiserror::Error;

/// Result type for flush operations.
pub type FlushResult<T> = Result<T, FlushError>;

/// Errors that can occur while building or executing a flush.
#[derive(Error, Debug)]
pub enum FlushError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote store answered with a non-success status.
    #[error("remote store rejected request with status {status}: {message}")]
    Remote {
        /// Status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The remote store rejected an entity with field-level errors.
    #[error("validation failed for {entity}: {errors}")]
    Validation {
        /// The rejected entity.
        entity: EntityKey,
        /// Field errors.
        errors: ValidationErrors,
    },

    /// A record that had to exist was absent from the response.
    #[error("no data received for {entity_type} with id {id}")]
    MissingRecord {
        /// Requested type.
        entity_type: EntityType,
        /// Requested id.
        id: String,
    },

    /// Belongs-to references among dirty entities form a cycle.
    #[error("dependency cycle among {} entities", .members.len())]
    DependencyCycle {
        /// Entities caught in or behind the cycle.
        members: Vec<EntityKey>,
    },

    /// An entity references another entity that has no server id yet.
    #[error("{entity} references {relationship} which is not persisted")]
    UnresolvedReference {
        /// The referencing entity.
        entity: EntityKey,
        /// Relationship name.
        relationship: String,
    },

    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Entity model error.
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

impl FlushError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            FlushError::Transport { retryable, .. } => *retryable,
            FlushError::Timeout => true,
            FlushError::Remote { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns the validation errors if this is a validation failure.
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            FlushError::Validation { errors, .. } => Some(errors),
            _ => None,
        }
    }
}

/// A failed flush: the first error observed plus whatever had already
/// been persisted when it was observed.
#[derive(Error, Debug)]
#[error("flush failed: {error}")]
pub struct FlushFailure {
    /// The first error observed.
    #[source]
    pub error: FlushError,
    /// Entities persisted before the failure was reported.
    pub partial: Vec<Entity>,
}

impl FlushFailure {
    /// Creates a failure without partial results.
    pub fn new(error: FlushError) -> Self {
        Self {
            error,
            partial: Vec::new(),
        }
    }
}

impl From<FlushError> for FlushFailure {
    fn from(error: FlushError) -> Self {
        Self::new(error)
    }
}
