//! Entities, local identities and relationship values.

use crate::error::{ModelError, ModelResult};
use crate::schema::{EntityDef, EntityType, RelationshipKind};
use crate::validation::ValidationErrors;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Session-local identity of an entity.
///
/// Client ids are assigned when an entity enters a session (either created
/// locally or loaded from the remote store) and never change afterwards,
/// even once the server assigns its own id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    /// Creates a client id from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Type plus local identity; enough to name an entity in logs and errors.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity type.
    pub entity_type: EntityType,
    /// Local identity.
    pub client_id: ClientId,
}

impl EntityKey {
    /// Creates a key.
    pub fn new(entity_type: impl Into<EntityType>, client_id: ClientId) -> Self {
        Self {
            entity_type: entity_type.into(),
            client_id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.client_id)
    }
}

/// Current value of a relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    /// Reference to a single entity, or none.
    BelongsTo(Option<ClientId>),
    /// Collection of referenced entities.
    HasMany(Vec<ClientId>),
}

impl Relationship {
    fn empty(kind: RelationshipKind) -> Self {
        match kind {
            RelationshipKind::BelongsTo => Relationship::BelongsTo(None),
            RelationshipKind::HasMany => Relationship::HasMany(Vec::new()),
        }
    }

    /// Returns the declared kind of this value.
    pub fn kind(&self) -> RelationshipKind {
        match self {
            Relationship::BelongsTo(_) => RelationshipKind::BelongsTo,
            Relationship::HasMany(_) => RelationshipKind::HasMany,
        }
    }
}

/// What changed between an entity and a prior snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A plain attribute.
    Attribute,
    /// A belongs-to reference.
    BelongsTo,
    /// A has-many collection.
    HasMany,
}

/// A single entry of an entity diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Kind of the changed field.
    pub kind: ChangeKind,
    /// Field name.
    pub name: String,
}

impl Change {
    fn new(kind: ChangeKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

/// A domain record tracked by a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    key: EntityKey,
    id: Option<String>,
    attributes: BTreeMap<String, Value>,
    relationships: BTreeMap<String, Relationship>,
    loaded: bool,
    new: bool,
    deleted: bool,
    errors: ValidationErrors,
}

impl Entity {
    fn blank(def: &EntityDef, client_id: ClientId) -> Self {
        Self {
            key: EntityKey::new(def.name.clone(), client_id),
            id: None,
            attributes: BTreeMap::new(),
            relationships: def
                .relationships
                .iter()
                .map(|r| (r.name.clone(), Relationship::empty(r.kind)))
                .collect(),
            loaded: true,
            new: false,
            deleted: false,
            errors: ValidationErrors::new(),
        }
    }

    /// Creates a new, never persisted entity.
    pub fn new(def: &EntityDef, client_id: ClientId) -> Self {
        let mut entity = Self::blank(def, client_id);
        entity.new = true;
        entity
    }

    /// Creates a loaded entity that already exists on the server.
    pub fn persisted(def: &EntityDef, client_id: ClientId, id: impl Into<String>) -> Self {
        let mut entity = Self::blank(def, client_id);
        entity.id = Some(id.into());
        entity
    }

    /// Creates a placeholder for a known but not yet loaded server record.
    pub fn stub(def: &EntityDef, client_id: ClientId, id: impl Into<String>) -> Self {
        let mut entity = Self::persisted(def, client_id, id);
        entity.loaded = false;
        entity
    }

    /// Returns the key.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Returns the entity type.
    pub fn entity_type(&self) -> &EntityType {
        &self.key.entity_type
    }

    /// Returns the local identity.
    pub fn client_id(&self) -> ClientId {
        self.key.client_id
    }

    /// Returns the server-assigned id, if any.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Sets the server-assigned id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Returns true if the entity's data is available.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Returns true if the entity was never persisted.
    pub fn is_new(&self) -> bool {
        self.new
    }

    /// Returns true if the entity is marked for deletion (or was deleted).
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Marks the entity as deleted.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    /// Marks the entity as persisted: loaded, not new.
    pub fn mark_persisted(&mut self) {
        self.new = false;
        self.loaded = true;
    }

    /// Returns true if both values refer to the same entity.
    pub fn is_same(&self, other: &Entity) -> bool {
        self.key == other.key
    }

    /// Returns an attribute value.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Sets an attribute value.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Removes an attribute.
    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    /// Returns all attributes.
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Iterates over relationships in name order.
    pub fn relationships(&self) -> impl Iterator<Item = (&str, &Relationship)> {
        self.relationships.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns a relationship value.
    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.get(name)
    }

    /// Returns the target of a belongs-to relationship.
    pub fn belongs_to(&self, name: &str) -> Option<ClientId> {
        match self.relationships.get(name) {
            Some(Relationship::BelongsTo(target)) => *target,
            _ => None,
        }
    }

    /// Returns the members of a has-many relationship.
    pub fn has_many(&self, name: &str) -> &[ClientId] {
        match self.relationships.get(name) {
            Some(Relationship::HasMany(targets)) => targets,
            _ => &[],
        }
    }

    /// Points a belongs-to relationship at another entity (or clears it).
    pub fn set_belongs_to(&mut self, name: &str, target: Option<ClientId>) -> ModelResult<()> {
        let relationship = self.relationship_mut(name, RelationshipKind::BelongsTo)?;
        if let Relationship::BelongsTo(slot) = relationship {
            *slot = target;
        }
        Ok(())
    }

    /// Replaces the members of a has-many relationship. Repeated members
    /// are kept once, at their first position.
    pub fn set_has_many(&mut self, name: &str, targets: Vec<ClientId>) -> ModelResult<()> {
        let relationship = self.relationship_mut(name, RelationshipKind::HasMany)?;
        if let Relationship::HasMany(slot) = relationship {
            let mut seen = BTreeSet::new();
            *slot = targets.into_iter().filter(|id| seen.insert(*id)).collect();
        }
        Ok(())
    }

    /// Adds a member to a has-many relationship.
    ///
    /// Returns `false` if the member was already present.
    pub fn add_to_has_many(&mut self, name: &str, target: ClientId) -> ModelResult<bool> {
        let Relationship::HasMany(members) = self.relationship_mut(name, RelationshipKind::HasMany)?
        else {
            return Ok(false);
        };
        if members.contains(&target) {
            return Ok(false);
        }
        members.push(target);
        Ok(true)
    }

    fn relationship_mut(
        &mut self,
        name: &str,
        kind: RelationshipKind,
    ) -> ModelResult<&mut Relationship> {
        let entity_type = &self.key.entity_type;
        let value = self
            .relationships
            .get_mut(name)
            .ok_or_else(|| ModelError::UnknownRelationship {
                entity_type: entity_type.clone(),
                name: name.to_string(),
            })?;
        if value.kind() != kind {
            return Err(ModelError::RelationshipKindMismatch {
                entity_type: entity_type.clone(),
                name: name.to_string(),
                expected: kind.as_str(),
            });
        }
        Ok(value)
    }

    /// Returns the validation errors from the last rejected request.
    pub fn errors(&self) -> &ValidationErrors {
        &self.errors
    }

    /// Replaces the validation errors.
    pub fn set_errors(&mut self, errors: ValidationErrors) {
        self.errors = errors;
    }

    /// Compares this entity against a prior snapshot.
    ///
    /// Attributes and relationships present on either side are compared;
    /// a field missing on one side counts as a change.
    pub fn diff(&self, cached: &Entity) -> Vec<Change> {
        let mut changes = Vec::new();

        for (name, value) in &self.attributes {
            if cached.attributes.get(name) != Some(value) {
                changes.push(Change::new(ChangeKind::Attribute, name));
            }
        }
        for name in cached.attributes.keys() {
            if !self.attributes.contains_key(name) {
                changes.push(Change::new(ChangeKind::Attribute, name));
            }
        }

        for (name, value) in &self.relationships {
            let changed = match (value, cached.relationships.get(name)) {
                (Relationship::BelongsTo(a), Some(Relationship::BelongsTo(b))) => a != b,
                (Relationship::BelongsTo(a), _) => a.is_some(),
                (Relationship::HasMany(a), Some(Relationship::HasMany(b))) => !same_members(a, b),
                (Relationship::HasMany(a), _) => !a.is_empty(),
            };
            if changed {
                let kind = match value {
                    Relationship::BelongsTo(_) => ChangeKind::BelongsTo,
                    Relationship::HasMany(_) => ChangeKind::HasMany,
                };
                changes.push(Change::new(kind, name));
            }
        }

        changes
    }

    /// Diffs against an empty record of the same type.
    ///
    /// Used when no server snapshot is known for a persisted entity.
    pub fn diff_from_empty(&self) -> Vec<Change> {
        let mut empty = self.clone();
        empty.attributes.clear();
        for value in empty.relationships.values_mut() {
            *value = Relationship::empty(value.kind());
        }
        self.diff(&empty)
    }

    /// Names of the fields that differ from `other`, in diff order.
    pub fn changed_fields(&self, other: &Entity) -> Vec<String> {
        self.diff(other).into_iter().map(|c| c.name).collect()
    }
}

/// Has-many collections compare as sets; the remote store does not
/// preserve ordering.
fn same_members(a: &[ClientId], b: &[ClientId]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntityDef;
    use serde_json::json;

    fn comment_def() -> EntityDef {
        EntityDef::new("comment")
            .attribute("body")
            .belongs_to("post", "post")
    }

    fn post_def() -> EntityDef {
        EntityDef::new("post")
            .attribute("title")
            .has_many("comments", "comment")
    }

    #[test]
    fn new_entity_has_declared_relationships() {
        let comment = Entity::new(&comment_def(), ClientId::new(1));
        assert!(comment.is_new());
        assert!(comment.is_loaded());
        assert_eq!(comment.relationship("post"), Some(&Relationship::BelongsTo(None)));
        assert_eq!(comment.key().to_string(), "comment#c1");
    }

    #[test]
    fn relationship_kind_is_enforced() {
        let mut post = Entity::new(&post_def(), ClientId::new(1));
        assert!(matches!(
            post.set_belongs_to("comments", Some(ClientId::new(2))),
            Err(ModelError::RelationshipKindMismatch { .. })
        ));
        assert!(matches!(
            post.set_belongs_to("author", None),
            Err(ModelError::UnknownRelationship { .. })
        ));
    }

    #[test]
    fn add_to_has_many_is_idempotent() {
        let mut post = Entity::new(&post_def(), ClientId::new(1));
        assert!(post.add_to_has_many("comments", ClientId::new(2)).unwrap());
        assert!(!post.add_to_has_many("comments", ClientId::new(2)).unwrap());
        assert_eq!(post.has_many("comments"), &[ClientId::new(2)]);
    }

    #[test]
    fn diff_reports_attribute_and_relationship_changes() {
        let mut cached = Entity::persisted(&comment_def(), ClientId::new(1), "10");
        cached.set_attribute("body", "hi");
        cached.set_belongs_to("post", Some(ClientId::new(2))).unwrap();

        let mut current = cached.clone();
        assert!(current.diff(&cached).is_empty());

        current.set_belongs_to("post", Some(ClientId::new(3))).unwrap();
        assert_eq!(
            current.diff(&cached),
            vec![Change::new(ChangeKind::BelongsTo, "post")]
        );

        current.set_attribute("body", json!("hello"));
        let kinds: Vec<_> = current.diff(&cached).into_iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Attribute, ChangeKind::BelongsTo]);
    }

    #[test]
    fn has_many_diff_ignores_order() {
        let mut cached = Entity::persisted(&post_def(), ClientId::new(1), "1");
        cached
            .set_has_many("comments", vec![ClientId::new(2), ClientId::new(3)])
            .unwrap();
        let mut current = cached.clone();
        current
            .set_has_many("comments", vec![ClientId::new(3), ClientId::new(2)])
            .unwrap();
        assert!(current.diff(&cached).is_empty());
    }

    #[test]
    fn has_many_diff_sees_through_repeated_members() {
        let (a, b) = (ClientId::new(5), ClientId::new(6));
        let mut cached = Entity::persisted(&post_def(), ClientId::new(1), "1");
        cached.set_has_many("comments", vec![a, b]).unwrap();

        // Built directly, bypassing the setter's dedupe.
        let mut repeated = cached.clone();
        repeated
            .relationships
            .insert("comments".to_string(), Relationship::HasMany(vec![a, a]));
        assert_eq!(repeated.changed_fields(&cached), vec!["comments".to_string()]);
        assert_eq!(cached.changed_fields(&repeated), vec!["comments".to_string()]);
    }

    #[test]
    fn set_has_many_drops_repeated_members() {
        let (a, b) = (ClientId::new(5), ClientId::new(6));
        let mut post = Entity::new(&post_def(), ClientId::new(1));
        post.set_has_many("comments", vec![b, a, b, a]).unwrap();
        assert_eq!(post.has_many("comments"), &[b, a]);
    }

    #[test]
    fn removed_attribute_is_a_change() {
        let mut cached = Entity::persisted(&post_def(), ClientId::new(1), "1");
        cached.set_attribute("title", "A");
        let mut current = cached.clone();
        current.remove_attribute("title");
        assert_eq!(current.changed_fields(&cached), vec!["title".to_string()]);
    }

    #[test]
    fn diff_from_empty_lists_populated_fields() {
        let mut comment = Entity::persisted(&comment_def(), ClientId::new(1), "1");
        assert!(comment.diff_from_empty().is_empty());

        comment.set_attribute("body", "hi");
        comment.set_belongs_to("post", Some(ClientId::new(9))).unwrap();
        assert_eq!(comment.diff_from_empty().len(), 2);
    }
}
