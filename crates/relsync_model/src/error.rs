//! Error types for the entity model.

use crate::entity::ClientId;
use crate::schema::EntityType;
use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors that can occur while working with entities and sessions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// The entity type is not registered in the schema.
    #[error("unknown entity type: {0}")]
    UnknownType(EntityType),

    /// The relationship is not declared for the entity type.
    #[error("unknown relationship {name} on {entity_type}")]
    UnknownRelationship {
        /// Entity type.
        entity_type: EntityType,
        /// Relationship name.
        name: String,
    },

    /// The relationship exists but has a different kind than requested.
    #[error("relationship {name} on {entity_type} is not a {expected} relationship")]
    RelationshipKindMismatch {
        /// Entity type.
        entity_type: EntityType,
        /// Relationship name.
        name: String,
        /// The kind that was requested.
        expected: &'static str,
    },

    /// The entity is not part of the session.
    #[error("entity {0} not found in session")]
    EntityNotFound(ClientId),

    /// The entity has no server-assigned id yet.
    #[error("entity {entity_type} {client_id} has no server id")]
    MissingServerId {
        /// Entity type.
        entity_type: EntityType,
        /// Local identity.
        client_id: ClientId,
    },
}
