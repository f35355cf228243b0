//! JSON fixtures describing a schema and a session's working set.
//!
//! ```json
//! {
//!   "schema": [{"name": "post", "attributes": ["title"], "relationships": []}],
//!   "entities": [{"ref": "p1", "type": "post", "state": "new", "attributes": {"title": "A"}}]
//! }
//! ```
//!
//! Entities refer to each other by `ref`. Persisted and deleted entities
//! need an `id`; their last-known server state defaults to their local
//! state and can be overridden with `server_attributes` and
//! `server_belongs_to`.

use relsync_model::{ClientId, Entity, EntityType, ModelError, Schema, Session};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while loading a fixture.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// The fixture file could not be read.
    #[error("failed to read fixture: {0}")]
    Io(#[from] std::io::Error),

    /// The fixture is not valid JSON or has the wrong shape.
    #[error("invalid fixture: {0}")]
    Parse(#[from] serde_json::Error),

    /// Two entities share a ref.
    #[error("duplicate ref {0}")]
    DuplicateRef(String),

    /// A relationship names a ref that does not exist.
    #[error("{entity} refers to unknown ref {reference}")]
    UnknownRef {
        /// The referring entity.
        entity: String,
        /// The missing ref.
        reference: String,
    },

    /// A persisted or deleted entity has no id.
    #[error("{0} is not new but has no id")]
    MissingId(String),

    /// The entity does not fit the schema.
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Lifecycle state of a fixture entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureState {
    /// Never persisted.
    #[default]
    New,
    /// Exists on the server.
    Persisted,
    /// Exists on the server and is marked for deletion.
    Deleted,
}

/// One entity of a fixture.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureEntity {
    /// Fixture-local name.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Entity type.
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    /// Lifecycle state.
    #[serde(default)]
    pub state: FixtureState,
    /// Server id.
    #[serde(default)]
    pub id: Option<String>,
    /// Local attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Local belongs-to references, by ref.
    #[serde(default)]
    pub belongs_to: BTreeMap<String, Option<String>>,
    /// Server attributes, when they differ from the local ones.
    #[serde(default)]
    pub server_attributes: Option<BTreeMap<String, Value>>,
    /// Server belongs-to references, when they differ from the local ones.
    #[serde(default)]
    pub server_belongs_to: Option<BTreeMap<String, Option<String>>>,
}

/// A parsed fixture.
#[derive(Debug, Clone, Deserialize)]
pub struct Fixture {
    /// Entity type definitions.
    pub schema: Schema,
    /// Working set.
    #[serde(default)]
    pub entities: Vec<FixtureEntity>,
}

/// A fixture turned into a session.
pub struct LoadedFixture {
    /// The session holding the working set.
    pub session: Session,
    /// Server records of persisted and deleted entities.
    pub server_records: Vec<Entity>,
    refs: BTreeMap<ClientId, String>,
}

impl LoadedFixture {
    /// Returns the fixture ref of an entity.
    pub fn reference(&self, client_id: ClientId) -> Option<&str> {
        self.refs.get(&client_id).map(String::as_str)
    }
}

impl Fixture {
    /// Reads a fixture file.
    pub fn from_path(path: &Path) -> Result<Self, FixtureError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses a fixture.
    pub fn parse(text: &str) -> Result<Self, FixtureError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Builds the session.
    ///
    /// Server state of persisted entities is recorded in the session's
    /// identity map, so unchanged entities start out clean.
    pub fn load(self) -> Result<LoadedFixture, FixtureError> {
        let session = Session::new(Arc::new(self.schema));
        let identity_map = Arc::clone(session.identity_map());

        let mut by_ref = BTreeMap::new();
        for entity in &self.entities {
            let client_id = match (&entity.state, &entity.id) {
                (FixtureState::New, _) => identity_map.allocate(),
                (_, Some(id)) => identity_map.client_id_for(&entity.entity_type, id),
                (_, None) => return Err(FixtureError::MissingId(entity.reference.clone())),
            };
            if by_ref.insert(entity.reference.clone(), client_id).is_some() {
                return Err(FixtureError::DuplicateRef(entity.reference.clone()));
            }
        }

        let mut server_records = Vec::new();
        for entity in &self.entities {
            let def = session.schema().entity(&entity.entity_type)?;
            let client_id = by_ref[&entity.reference];

            let mut local = match &entity.id {
                Some(id) if entity.state != FixtureState::New => {
                    Entity::persisted(def, client_id, id.clone())
                }
                _ => Entity::new(def, client_id),
            };

            if entity.state != FixtureState::New {
                let mut server = local.clone();
                apply(
                    &mut server,
                    entity,
                    entity.server_attributes.as_ref().unwrap_or(&entity.attributes),
                    entity.server_belongs_to.as_ref().unwrap_or(&entity.belongs_to),
                    &by_ref,
                )?;
                identity_map.upsert(&server)?;
                server_records.push(server);
            }

            apply(&mut local, entity, &entity.attributes, &entity.belongs_to, &by_ref)?;
            if entity.state == FixtureState::Deleted {
                local.mark_deleted();
            }
            session.insert(local)?;
        }

        let refs = by_ref.into_iter().map(|(name, id)| (id, name)).collect();
        Ok(LoadedFixture {
            session,
            server_records,
            refs,
        })
    }
}

fn apply(
    target: &mut Entity,
    entity: &FixtureEntity,
    attributes: &BTreeMap<String, Value>,
    belongs_to: &BTreeMap<String, Option<String>>,
    by_ref: &BTreeMap<String, ClientId>,
) -> Result<(), FixtureError> {
    for (name, value) in attributes {
        target.set_attribute(name.clone(), value.clone());
    }
    for (name, reference) in belongs_to {
        let parent = match reference {
            Some(reference) => Some(*by_ref.get(reference).ok_or_else(|| FixtureError::UnknownRef {
                entity: entity.reference.clone(),
                reference: reference.clone(),
            })?),
            None => None,
        };
        target.set_belongs_to(name, parent)?;
    }
    Ok(())
}
