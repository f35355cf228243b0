//! # relsync model
//!
//! Entity model shared by the relsync flush engine.
//!
//! This crate provides:
//! - Schema descriptions of entity types and their relationships
//! - Entities with attributes, belongs-to/has-many relationships and diffs
//! - An identity map of server ids, local ids and server snapshots
//! - Sessions holding the working set of locally mutated entities
//!
//! Relationships are described by the schema rather than discovered at
//! runtime, and every entity value carries the tagged [`Relationship`]
//! variant for each declared name.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod identity_map;
mod schema;
mod session;
mod validation;

pub use entity::{Change, ChangeKind, ClientId, Entity, EntityKey, Relationship};
pub use error::{ModelError, ModelResult};
pub use identity_map::IdentityMap;
pub use schema::{EntityDef, EntityType, RelationshipDef, RelationshipKind, Schema};
pub use session::{Session, SessionObserver};
pub use validation::ValidationErrors;
