//! JSON payload conventions for the REST adapter.
//!
//! Payloads are keyed by root: a singular root (`"post"`) holds one record,
//! a plural root (`"posts"`) holds an array. Belongs-to relationships
//! travel as `<name>_id`, has-many relationships as `<name>` id arrays.

use crate::error::{FlushError, FlushResult};
use relsync_model::{
    ClientId, Entity, EntityDef, EntityType, IdentityMap, Relationship, RelationshipKind, Schema,
    ValidationErrors,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Encodes entities into request bodies and decodes response payloads.
#[derive(Debug, Clone)]
pub struct JsonSerializer {
    schema: Arc<Schema>,
    plurals: BTreeMap<String, String>,
}

impl JsonSerializer {
    /// Creates a serializer for the schema.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            plurals: BTreeMap::new(),
        }
    }

    /// Sets irregular plural forms.
    pub fn with_plurals(mut self, plurals: BTreeMap<String, String>) -> Self {
        self.plurals = plurals;
        self
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Root key for a type.
    pub fn root_for_type(&self, entity_type: &EntityType) -> String {
        entity_type.as_str().to_string()
    }

    /// Plural form of a root.
    pub fn pluralize(&self, root: &str) -> String {
        if let Some(plural) = self.plurals.get(root) {
            return plural.clone();
        }
        if let Some(stem) = root.strip_suffix('y') {
            let vowel_before = stem.ends_with(['a', 'e', 'i', 'o', 'u']);
            if !stem.is_empty() && !vowel_before {
                return format!("{stem}ies");
            }
        }
        if ["s", "x", "ch", "sh"].iter().any(|suffix| root.ends_with(suffix)) {
            return format!("{root}es");
        }
        format!("{root}s")
    }

    /// Serializes an entity into a record object.
    ///
    /// Belongs-to targets must already carry a server id.
    pub fn serialize(
        &self,
        entity: &Entity,
        include_id: bool,
        identity_map: &IdentityMap,
    ) -> FlushResult<Map<String, Value>> {
        let mut record = Map::new();
        if include_id {
            if let Some(id) = entity.id() {
                record.insert("id".to_string(), Value::String(id.to_string()));
            }
        }

        for (name, value) in entity.attributes() {
            record.insert(name.clone(), value.clone());
        }

        for (name, relationship) in entity.relationships() {
            let Relationship::BelongsTo(target) = relationship else {
                continue;
            };
            let value = match target {
                Some(target) => match identity_map.server_id(*target) {
                    Some(id) => Value::String(id),
                    None => {
                        return Err(FlushError::UnresolvedReference {
                            entity: entity.key().clone(),
                            relationship: name.to_string(),
                        })
                    }
                },
                None => Value::Null,
            };
            record.insert(format!("{name}_id"), value);
        }

        Ok(record)
    }

    /// Wraps a serialized record in its root key.
    pub fn serialize_root(
        &self,
        entity: &Entity,
        include_id: bool,
        identity_map: &IdentityMap,
    ) -> FlushResult<Value> {
        let record = self.serialize(entity, include_id, identity_map)?;
        let mut body = Map::new();
        body.insert(self.root_for_type(entity.entity_type()), Value::Object(record));
        Ok(Value::Object(body))
    }

    /// Returns the id of the record held under the type's singular root.
    pub fn primary_id(&self, payload: &Value, entity_type: &EntityType) -> Option<String> {
        payload
            .get(self.root_for_type(entity_type))
            .and_then(|record| record.get("id"))
            .and_then(id_string)
    }

    /// Decodes every record in a payload.
    ///
    /// Unknown roots are ignored. Each record is mapped to the local
    /// identity the identity map knows for it, allocating one for records
    /// not seen before.
    pub fn deserialize(
        &self,
        payload: &Value,
        identity_map: &IdentityMap,
    ) -> FlushResult<Vec<Entity>> {
        let roots = payload
            .as_object()
            .ok_or_else(|| FlushError::Codec("payload is not an object".into()))?;

        let mut entities = Vec::new();
        for (root, value) in roots {
            if let Some(def) = self.schema.get(&EntityType::new(root.as_str())) {
                entities.push(self.deserialize_record(def, value, identity_map)?);
            } else if let Some(def) = self.type_for_plural(root) {
                let records = value
                    .as_array()
                    .ok_or_else(|| FlushError::Codec(format!("root {root} is not an array")))?;
                for record in records {
                    entities.push(self.deserialize_record(def, record, identity_map)?);
                }
            }
        }
        Ok(entities)
    }

    fn type_for_plural(&self, root: &str) -> Option<&EntityDef> {
        self.schema
            .types()
            .find(|def| self.pluralize(&self.root_for_type(&def.name)) == root)
    }

    fn deserialize_record(
        &self,
        def: &EntityDef,
        record: &Value,
        identity_map: &IdentityMap,
    ) -> FlushResult<Entity> {
        let fields = record
            .as_object()
            .ok_or_else(|| FlushError::Codec(format!("{} record is not an object", def.name)))?;
        let id = fields
            .get("id")
            .and_then(id_string)
            .ok_or_else(|| FlushError::Codec(format!("{} record has no id", def.name)))?;

        let client_id = identity_map.client_id_for(&def.name, &id);
        let mut entity = Entity::persisted(def, client_id, id);

        for relationship in &def.relationships {
            match relationship.kind {
                RelationshipKind::BelongsTo => {
                    let target = fields
                        .get(&format!("{}_id", relationship.name))
                        .and_then(id_string)
                        .map(|id| identity_map.client_id_for(&relationship.target, &id));
                    entity.set_belongs_to(&relationship.name, target)?;
                }
                RelationshipKind::HasMany => {
                    let members: Vec<ClientId> = fields
                        .get(&relationship.name)
                        .and_then(Value::as_array)
                        .map(|ids| {
                            ids.iter()
                                .filter_map(id_string)
                                .map(|id| identity_map.client_id_for(&relationship.target, &id))
                                .collect()
                        })
                        .unwrap_or_default();
                    entity.set_has_many(&relationship.name, members)?;
                }
            }
        }

        for (name, value) in fields {
            if name == "id" || def.relationship_named(name).is_some() {
                continue;
            }
            if is_reference_key(def, name) {
                continue;
            }
            if def.accepts_attribute(name) {
                entity.set_attribute(name.clone(), value.clone());
            }
        }

        Ok(entity)
    }

    /// Extracts field errors from an error response body.
    ///
    /// Accepts `{"errors": {field: [message, ...]}}` and single-message
    /// values. Returns `None` when the body carries no such structure.
    pub fn extract_validation_errors(body: &Value) -> Option<ValidationErrors> {
        let fields = body.get("errors")?.as_object()?;
        let mut errors = ValidationErrors::new();
        for (field, messages) in fields {
            match messages {
                Value::Array(messages) => {
                    for message in messages {
                        errors.add(field.clone(), message_text(message));
                    }
                }
                other => errors.add(field.clone(), message_text(other)),
            }
        }
        if errors.is_empty() {
            None
        } else {
            Some(errors)
        }
    }
}

fn is_reference_key(def: &EntityDef, key: &str) -> bool {
    key.strip_suffix("_id")
        .and_then(|name| def.relationship_named(name))
        .is_some_and(|r| r.kind == RelationshipKind::BelongsTo)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn message_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
