//! Sessions: the working set of entities a flush operates on.
//!
//! A session owns the locally mutated copies of its entities and shares
//! the schema and identity map with whatever remote store it is flushed
//! against. Observers are notified after each committed change; a change
//! made through [`Session::batch`] is committed and reported as a whole,
//! so an observer never sees a half-applied edit.

use crate::entity::{ClientId, Entity, EntityKey};
use crate::error::{ModelError, ModelResult};
use crate::identity_map::IdentityMap;
use crate::schema::{EntityType, Schema};
use crate::validation::ValidationErrors;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Receives notifications about committed entity changes.
pub trait SessionObserver: Send + Sync {
    /// Called once per committed change with the names of the fields that
    /// changed.
    fn entity_changed(&self, key: &EntityKey, fields: &[String]);
}

/// The working set of a unit of work.
pub struct Session {
    schema: Arc<Schema>,
    identity_map: Arc<IdentityMap>,
    entities: RwLock<BTreeMap<ClientId, Entity>>,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

impl Session {
    /// Creates a session with a fresh identity map.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self::with_identity_map(schema, Arc::new(IdentityMap::new()))
    }

    /// Creates a session sharing an existing identity map.
    pub fn with_identity_map(schema: Arc<Schema>, identity_map: Arc<IdentityMap>) -> Self {
        Self {
            schema,
            identity_map,
            entities: RwLock::new(BTreeMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Returns the identity map.
    pub fn identity_map(&self) -> &Arc<IdentityMap> {
        &self.identity_map
    }

    /// Registers an observer.
    pub fn observe(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.write().push(observer);
    }

    /// Creates a new entity of the given type and adds it to the working set.
    pub fn create(&self, entity_type: &EntityType) -> ModelResult<ClientId> {
        let def = self.schema.entity(entity_type)?;
        let entity = Entity::new(def, self.identity_map.allocate());
        let client_id = entity.client_id();
        self.entities.write().insert(client_id, entity);
        Ok(client_id)
    }

    /// Adds a server record to the working set and records its snapshot.
    ///
    /// This is how entities returned by `find`/`query` enter a session.
    pub fn track(&self, entity: Entity) -> ModelResult<ClientId> {
        self.schema.entity(entity.entity_type())?;
        if entity.id().is_some() && !entity.is_new() {
            self.identity_map.upsert(&entity)?;
        }
        let client_id = entity.client_id();
        self.entities.write().insert(client_id, entity);
        Ok(client_id)
    }

    /// Adds an entity to the working set as-is, without touching the
    /// identity map.
    pub fn insert(&self, entity: Entity) -> ModelResult<ClientId> {
        self.schema.entity(entity.entity_type())?;
        let client_id = entity.client_id();
        self.entities.write().insert(client_id, entity);
        Ok(client_id)
    }

    /// Returns a copy of an entity.
    pub fn get(&self, client_id: ClientId) -> Option<Entity> {
        self.entities.read().get(&client_id).cloned()
    }

    /// Returns true if the entity is in the working set.
    pub fn contains(&self, client_id: ClientId) -> bool {
        self.entities.read().contains_key(&client_id)
    }

    /// Returns a snapshot of the working set in client id order.
    pub fn entities(&self) -> Vec<Entity> {
        self.entities.read().values().cloned().collect()
    }

    /// Returns the number of entities in the working set.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Returns true if the working set is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Removes an entity from the working set.
    pub fn remove(&self, client_id: ClientId) -> Option<Entity> {
        self.entities.write().remove(&client_id)
    }

    /// Applies several edits to one entity as a single change.
    ///
    /// The closure works on a copy; the copy replaces the stored entity only
    /// if the closure succeeds. Observers are notified once afterwards, and
    /// only if something actually changed.
    pub fn batch<R>(
        &self,
        client_id: ClientId,
        edit: impl FnOnce(&mut Entity) -> ModelResult<R>,
    ) -> ModelResult<R> {
        let (key, fields, result) = {
            let mut entities = self.entities.write();
            let current = entities
                .get_mut(&client_id)
                .ok_or(ModelError::EntityNotFound(client_id))?;

            let mut draft = current.clone();
            let result = edit(&mut draft)?;
            let fields = draft.changed_fields(current);
            *current = draft;
            (current.key().clone(), fields, result)
        };

        if !fields.is_empty() {
            self.notify(&key, &fields);
        }
        Ok(result)
    }

    /// Sets an attribute.
    pub fn set_attribute(
        &self,
        client_id: ClientId,
        name: &str,
        value: impl Into<Value>,
    ) -> ModelResult<()> {
        let value = value.into();
        self.batch(client_id, |entity| {
            entity.set_attribute(name, value);
            Ok(())
        })
    }

    /// Points a belongs-to relationship at another entity.
    pub fn set_belongs_to(
        &self,
        client_id: ClientId,
        name: &str,
        target: Option<ClientId>,
    ) -> ModelResult<()> {
        self.batch(client_id, |entity| entity.set_belongs_to(name, target))
    }

    /// Marks an entity for deletion on the next flush.
    pub fn delete(&self, client_id: ClientId) -> ModelResult<()> {
        self.batch(client_id, |entity| {
            entity.mark_deleted();
            Ok(())
        })
    }

    /// Attaches validation errors reported by the remote store.
    ///
    /// Observers are told about the change under the `errors` field.
    pub fn attach_errors(&self, client_id: ClientId, errors: ValidationErrors) -> ModelResult<()> {
        let key = {
            let mut entities = self.entities.write();
            let entity = entities
                .get_mut(&client_id)
                .ok_or(ModelError::EntityNotFound(client_id))?;
            if *entity.errors() == errors {
                return Ok(());
            }
            entity.set_errors(errors);
            entity.key().clone()
        };

        self.notify(&key, &["errors".to_string()]);
        Ok(())
    }

    /// Merges a server-confirmed entity into the session.
    ///
    /// The working copy is replaced by the confirmed state and the identity
    /// map snapshot is updated. A confirmed deletion removes the entity from
    /// both the working set and the identity map.
    pub fn merge(&self, confirmed: Entity) -> ModelResult<Entity> {
        let client_id = confirmed.client_id();

        if confirmed.is_deleted() {
            self.entities.write().remove(&client_id);
            self.identity_map.evict(client_id);
            trace!(entity = %confirmed.key(), "merged deletion");
            return Ok(confirmed);
        }

        let mut confirmed = confirmed;
        confirmed.mark_persisted();
        confirmed.set_errors(ValidationErrors::new());
        self.identity_map.upsert(&confirmed)?;

        let fields = {
            let mut entities = self.entities.write();
            let fields = entities
                .get(&client_id)
                .map(|previous| confirmed.changed_fields(previous))
                .unwrap_or_default();
            entities.insert(client_id, confirmed.clone());
            fields
        };

        trace!(entity = %confirmed.key(), changed = fields.len(), "merged");
        if !fields.is_empty() {
            self.notify(confirmed.key(), &fields);
        }
        Ok(confirmed)
    }

    fn notify(&self, key: &EntityKey, fields: &[String]) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.entity_changed(key, fields);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntityDef;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(EntityKey, Vec<String>)>>,
    }

    impl SessionObserver for Recorder {
        fn entity_changed(&self, key: &EntityKey, fields: &[String]) {
            self.events.lock().push((key.clone(), fields.to_vec()));
        }
    }

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new()
                .with_type(
                    EntityDef::new("post")
                        .attribute("title")
                        .has_many("comments", "comment"),
                )
                .with_type(
                    EntityDef::new("comment")
                        .attribute("body")
                        .belongs_to("post", "post"),
                ),
        )
    }

    #[test]
    fn create_unknown_type_fails() {
        let session = Session::new(schema());
        assert!(matches!(
            session.create(&"tag".into()),
            Err(ModelError::UnknownType(_))
        ));
    }

    #[test]
    fn batch_notifies_once() {
        let session = Session::new(schema());
        let recorder = Arc::new(Recorder::default());
        session.observe(recorder.clone());

        let post = session.create(&"post".into()).unwrap();
        session
            .batch(post, |entity| {
                entity.set_attribute("title", "A");
                entity.add_to_has_many("comments", ClientId::new(90))?;
                entity.add_to_has_many("comments", ClientId::new(91))?;
                Ok(())
            })
            .unwrap();

        let events = recorder.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, vec!["title".to_string(), "comments".to_string()]);
    }

    #[test]
    fn batch_with_repeated_members_is_a_change() {
        let session = Session::new(schema());
        let post = session.create(&"post".into()).unwrap();
        let (a, b) = (ClientId::new(50), ClientId::new(51));
        session
            .batch(post, |entity| entity.set_has_many("comments", vec![a, b]))
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        session.observe(recorder.clone());
        session
            .batch(post, |entity| entity.set_has_many("comments", vec![a, a]))
            .unwrap();

        assert_eq!(session.get(post).unwrap().has_many("comments"), &[a]);
        let events = recorder.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, vec!["comments".to_string()]);
    }

    #[test]
    fn attached_errors_are_observed() {
        let session = Session::new(schema());
        let post = session.create(&"post".into()).unwrap();
        let recorder = Arc::new(Recorder::default());
        session.observe(recorder.clone());

        let errors = ValidationErrors::new().with("title", "can't be blank");
        session.attach_errors(post, errors.clone()).unwrap();
        session.attach_errors(post, errors).unwrap();

        assert!(session.get(post).unwrap().errors().has("title"));
        let events = recorder.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0.client_id, post);
        assert_eq!(events[0].1, vec!["errors".to_string()]);
    }

    #[test]
    fn failed_batch_leaves_entity_untouched() {
        let session = Session::new(schema());
        let recorder = Arc::new(Recorder::default());
        session.observe(recorder.clone());

        let post = session.create(&"post".into()).unwrap();
        let result = session.batch(post, |entity| {
            entity.set_attribute("title", "A");
            entity.set_belongs_to("comments", None)
        });

        assert!(result.is_err());
        assert!(session.get(post).unwrap().attribute("title").is_none());
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn merge_updates_identity_map() {
        let session = Session::new(schema());
        let post = session.create(&"post".into()).unwrap();
        session.set_attribute(post, "title", "A").unwrap();

        let mut confirmed = session.get(post).unwrap();
        confirmed.set_id("12");
        let merged = session.merge(confirmed).unwrap();

        assert!(!merged.is_new());
        assert_eq!(session.get(post).unwrap().id(), Some("12"));
        assert_eq!(
            session.identity_map().lookup(&"post".into(), "12"),
            Some(post)
        );
    }

    #[test]
    fn merged_deletion_leaves_session() {
        let session = Session::new(schema());
        let def = session.schema().entity(&"post".into()).unwrap().clone();
        let client_id = session.identity_map().allocate();
        session
            .track(Entity::persisted(&def, client_id, "5"))
            .unwrap();
        session.delete(client_id).unwrap();

        let confirmed = session.get(client_id).unwrap();
        session.merge(confirmed).unwrap();

        assert!(!session.contains(client_id));
        assert!(session.identity_map().snapshot(client_id).is_none());
    }
}
