//! Schema descriptions for entity types and their relationships.
//!
//! Relationships are declared per type instead of being discovered at
//! runtime. The flush engine relies on two questions being answerable
//! from the schema alone:
//!
//! - which relationships of a type are belongs-to (dependency edges)
//! - which relationship on the other side is the inverse of a given one

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of an entity type (e.g. `post`, `comment`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Creates an entity type name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Kind of a declared relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Single reference to an entity this one depends on.
    BelongsTo,
    /// Collection of entities that reference this one.
    HasMany,
}

impl RelationshipKind {
    /// Returns a human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::BelongsTo => "belongs-to",
            RelationshipKind::HasMany => "has-many",
        }
    }
}

/// A relationship declared on an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDef {
    /// Relationship name.
    pub name: String,
    /// Relationship kind.
    pub kind: RelationshipKind,
    /// Type of the related entity.
    pub target: EntityType,
    /// Name of the inverse relationship on the target type, if fixed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,
}

impl RelationshipDef {
    /// Declares a belongs-to relationship.
    pub fn belongs_to(name: impl Into<String>, target: impl Into<EntityType>) -> Self {
        Self {
            name: name.into(),
            kind: RelationshipKind::BelongsTo,
            target: target.into(),
            inverse: None,
        }
    }

    /// Declares a has-many relationship.
    pub fn has_many(name: impl Into<String>, target: impl Into<EntityType>) -> Self {
        Self {
            name: name.into(),
            kind: RelationshipKind::HasMany,
            target: target.into(),
            inverse: None,
        }
    }

    /// Pins the inverse relationship name.
    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }
}

/// Description of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDef {
    /// Type name.
    pub name: EntityType,
    /// Plain attribute names. Empty means "accept any attribute".
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Declared relationships.
    #[serde(default)]
    pub relationships: Vec<RelationshipDef>,
}

impl EntityDef {
    /// Creates an empty definition.
    pub fn new(name: impl Into<EntityType>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Adds a plain attribute.
    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.push(name.into());
        self
    }

    /// Adds a belongs-to relationship.
    pub fn belongs_to(self, name: impl Into<String>, target: impl Into<EntityType>) -> Self {
        self.relationship(RelationshipDef::belongs_to(name, target))
    }

    /// Adds a has-many relationship.
    pub fn has_many(self, name: impl Into<String>, target: impl Into<EntityType>) -> Self {
        self.relationship(RelationshipDef::has_many(name, target))
    }

    /// Adds an arbitrary relationship definition.
    pub fn relationship(mut self, relationship: RelationshipDef) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Looks up a relationship by name.
    pub fn relationship_named(&self, name: &str) -> Option<&RelationshipDef> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Returns true if the attribute is declared (or any attribute is accepted).
    pub fn accepts_attribute(&self, name: &str) -> bool {
        self.attributes.is_empty() || self.attributes.iter().any(|a| a == name)
    }

    /// Iterates over belongs-to relationships.
    pub fn belongs_to_relationships(&self) -> impl Iterator<Item = &RelationshipDef> {
        self.relationships
            .iter()
            .filter(|r| r.kind == RelationshipKind::BelongsTo)
    }
}

/// Registry of entity type definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<EntityDef>", into = "Vec<EntityDef>")]
pub struct Schema {
    types: BTreeMap<EntityType, EntityDef>,
}

impl Schema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type (builder style).
    pub fn with_type(mut self, def: EntityDef) -> Self {
        self.register(def);
        self
    }

    /// Registers or replaces a type definition.
    pub fn register(&mut self, def: EntityDef) {
        self.types.insert(def.name.clone(), def);
    }

    /// Looks up a type definition.
    pub fn get(&self, entity_type: &EntityType) -> Option<&EntityDef> {
        self.types.get(entity_type)
    }

    /// Looks up a type definition, failing if it is unknown.
    pub fn entity(&self, entity_type: &EntityType) -> ModelResult<&EntityDef> {
        self.get(entity_type)
            .ok_or_else(|| ModelError::UnknownType(entity_type.clone()))
    }

    /// Looks up a relationship definition, failing if it is unknown.
    pub fn relationship(
        &self,
        entity_type: &EntityType,
        name: &str,
    ) -> ModelResult<&RelationshipDef> {
        self.entity(entity_type)?
            .relationship_named(name)
            .ok_or_else(|| ModelError::UnknownRelationship {
                entity_type: entity_type.clone(),
                name: name.to_string(),
            })
    }

    /// Resolves the inverse of a relationship.
    ///
    /// An explicitly declared inverse wins. Otherwise the inverse is the
    /// single relationship on the target type that points back at
    /// `entity_type` and does not pin a different inverse. Ambiguous
    /// candidates resolve to `None`.
    pub fn inverse_for(&self, entity_type: &EntityType, name: &str) -> Option<&RelationshipDef> {
        let def = self.get(entity_type)?.relationship_named(name)?;
        let target = self.get(&def.target)?;

        if let Some(inverse) = &def.inverse {
            return target.relationship_named(inverse);
        }

        let mut candidates = target.relationships.iter().filter(|r| {
            r.target == *entity_type
                && r.inverse.as_deref().map_or(true, |inv| inv == name)
                && !(target.name == *entity_type && r.name == name)
        });

        let first = candidates.next()?;
        if candidates.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Iterates over all registered definitions.
    pub fn types(&self) -> impl Iterator<Item = &EntityDef> {
        self.types.values()
    }

    /// Returns the number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if no type is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl From<Vec<EntityDef>> for Schema {
    fn from(defs: Vec<EntityDef>) -> Self {
        let mut schema = Schema::new();
        for def in defs {
            schema.register(def);
        }
        schema
    }
}

impl From<Schema> for Vec<EntityDef> {
    fn from(schema: Schema) -> Self {
        schema.types.into_values().collect()
    }
}
