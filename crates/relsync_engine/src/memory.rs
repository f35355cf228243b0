//! In-memory remote store.
//!
//! Behaves like a small server: it assigns ids, keeps the records it was
//! sent and refuses references to entities it has never seen. Every call
//! is logged with a global sequence number so tests can assert on the
//! order in which operations started and finished.

use crate::error::{FlushError, FlushResult};
use crate::remote::{QueryParams, RemoteStore};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use relsync_model::{
    ClientId, Entity, EntityKey, EntityType, IdentityMap, ModelError, Relationship, Session,
    ValidationErrors,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Remote operation kinds, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOperation {
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `find`
    Find,
    /// `query`
    Query,
}

/// Phase of a logged call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    /// The call was received.
    Started,
    /// The call succeeded.
    Finished,
    /// The call failed.
    Failed,
}

/// One entry of the call log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallEvent {
    /// Global sequence number.
    pub sequence: u64,
    /// Phase.
    pub phase: CallPhase,
    /// Operation.
    pub operation: RemoteOperation,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity the call was about, for write operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKey>,
}

/// A failure the store reports instead of performing writes for a type.
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// Reject with field errors.
    Validation(ValidationErrors),
    /// Reject with a status code.
    Status {
        /// Status code.
        status: u16,
        /// Message.
        message: String,
    },
    /// Fail at the transport level.
    Transport(String),
}

impl ScriptedFailure {
    fn to_error(&self, entity: &Entity) -> FlushError {
        match self {
            ScriptedFailure::Validation(errors) => FlushError::Validation {
                entity: entity.key().clone(),
                errors: errors.clone(),
            },
            ScriptedFailure::Status { status, message } => FlushError::Remote {
                status: *status,
                message: message.clone(),
            },
            ScriptedFailure::Transport(message) => {
                FlushError::transport_retryable(message.clone())
            }
        }
    }
}

/// A remote store that keeps records in memory.
pub struct MemoryRemoteStore {
    identity_map: Arc<IdentityMap>,
    records: RwLock<BTreeMap<(EntityType, String), Entity>>,
    next_id: AtomicU64,
    sequence: AtomicU64,
    calls: Mutex<Vec<CallEvent>>,
    failures: RwLock<HashMap<EntityType, ScriptedFailure>>,
    latencies: RwLock<HashMap<EntityType, Duration>>,
    default_latency: Duration,
    echo_has_many: AtomicBool,
}

impl MemoryRemoteStore {
    /// Creates a store that merges into the session's identity map.
    pub fn new(session: &Session) -> Self {
        Self::with_identity_map(Arc::clone(session.identity_map()))
    }

    /// Creates a store that merges into the given identity map.
    pub fn with_identity_map(identity_map: Arc<IdentityMap>) -> Self {
        Self {
            identity_map,
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
            failures: RwLock::new(HashMap::new()),
            latencies: RwLock::new(HashMap::new()),
            default_latency: Duration::ZERO,
            echo_has_many: AtomicBool::new(false),
        }
    }

    /// Sets the latency applied to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    /// Sets the latency for calls about one type.
    pub fn set_latency(&self, entity_type: impl Into<EntityType>, latency: Duration) {
        self.latencies.write().insert(entity_type.into(), latency);
    }

    /// Controls whether write responses echo has-many collections as sent.
    ///
    /// Off by default: responses only list members the store already knows,
    /// so a freshly created parent comes back without its new children.
    pub fn set_echo_has_many(&self, echo: bool) {
        self.echo_has_many.store(echo, Ordering::SeqCst);
    }

    /// Makes every write for the type fail.
    pub fn fail(&self, entity_type: impl Into<EntityType>, failure: ScriptedFailure) {
        self.failures.write().insert(entity_type.into(), failure);
    }

    /// Removes a scripted failure.
    pub fn clear_failure(&self, entity_type: &EntityType) {
        self.failures.write().remove(entity_type);
    }

    /// Stores a record as if it had been persisted earlier.
    pub fn seed(&self, entity: &Entity) -> FlushResult<()> {
        let id = entity.id().ok_or_else(|| ModelError::MissingServerId {
            entity_type: entity.entity_type().clone(),
            client_id: entity.client_id(),
        })?;
        self.identity_map.upsert(entity)?;
        self.records
            .write()
            .insert((entity.entity_type().clone(), id.to_string()), entity.clone());
        Ok(())
    }

    /// Returns a stored record.
    pub fn record(&self, entity_type: &EntityType, id: &str) -> Option<Entity> {
        self.records
            .read()
            .get(&(entity_type.clone(), id.to_string()))
            .cloned()
    }

    /// Returns the number of stored records.
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    /// Returns the call log.
    pub fn calls(&self) -> Vec<CallEvent> {
        self.calls.lock().clone()
    }

    /// Returns the number of write calls received.
    pub fn write_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.phase == CallPhase::Started && c.entity.is_some())
            .count()
    }

    /// Returns the sequence number at which a call about the entity
    /// reached the given phase.
    pub fn sequence_of(&self, key: &EntityKey, phase: CallPhase) -> Option<u64> {
        self.calls
            .lock()
            .iter()
            .find(|c| c.phase == phase && c.entity.as_ref() == Some(key))
            .map(|c| c.sequence)
    }

    fn log(
        &self,
        phase: CallPhase,
        operation: RemoteOperation,
        entity_type: &EntityType,
        entity: Option<&EntityKey>,
    ) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        trace!(sequence, ?phase, ?operation, %entity_type, "memory store call");
        self.calls.lock().push(CallEvent {
            sequence,
            phase,
            operation,
            entity_type: entity_type.clone(),
            entity: entity.cloned(),
        });
    }

    async fn wait(&self, entity_type: &EntityType) {
        let latency = self
            .latencies
            .read()
            .get(entity_type)
            .copied()
            .unwrap_or(self.default_latency);
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
    }

    async fn write(
        &self,
        operation: RemoteOperation,
        entity: &Entity,
        apply: impl FnOnce() -> FlushResult<Entity>,
    ) -> FlushResult<Entity> {
        self.log(CallPhase::Started, operation, entity.entity_type(), Some(entity.key()));
        self.wait(entity.entity_type()).await;

        let failure = self.failures.read().get(entity.entity_type()).cloned();
        let result = match failure {
            Some(failure) => Err(failure.to_error(entity)),
            None => apply(),
        };

        let phase = if result.is_ok() {
            CallPhase::Finished
        } else {
            CallPhase::Failed
        };
        self.log(phase, operation, entity.entity_type(), Some(entity.key()));
        result
    }

    /// Every belongs-to target must already be known to the server.
    fn check_references(&self, entity: &Entity) -> FlushResult<()> {
        for (name, relationship) in entity.relationships() {
            if let Relationship::BelongsTo(Some(target)) = relationship {
                if self.identity_map.server_id(*target).is_none() {
                    return Err(FlushError::UnresolvedReference {
                        entity: entity.key().clone(),
                        relationship: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn confirm(&self, entity: &Entity, id: String) -> FlushResult<Entity> {
        let mut confirmed = entity.clone();
        confirmed.set_id(id.clone());
        confirmed.mark_persisted();
        confirmed.set_errors(ValidationErrors::new());

        if !self.echo_has_many.load(Ordering::SeqCst) {
            let collections: Vec<(String, Vec<ClientId>)> = confirmed
                .relationships()
                .filter_map(|(name, r)| match r {
                    Relationship::HasMany(members) => Some((
                        name.to_string(),
                        members
                            .iter()
                            .copied()
                            .filter(|m| self.identity_map.server_id(*m).is_some())
                            .collect(),
                    )),
                    Relationship::BelongsTo(_) => None,
                })
                .collect();
            for (name, known) in collections {
                confirmed.set_has_many(&name, known)?;
            }
        }

        self.identity_map
            .bind(confirmed.entity_type(), &id, confirmed.client_id());
        self.identity_map.upsert(&confirmed)?;
        self.records
            .write()
            .insert((confirmed.entity_type().clone(), id), confirmed.clone());
        Ok(confirmed)
    }

    fn existing_id(&self, entity: &Entity) -> FlushResult<String> {
        let id = entity.id().ok_or_else(|| ModelError::MissingServerId {
            entity_type: entity.entity_type().clone(),
            client_id: entity.client_id(),
        })?;
        if !self
            .records
            .read()
            .contains_key(&(entity.entity_type().clone(), id.to_string()))
        {
            return Err(FlushError::Remote {
                status: 404,
                message: format!("{} {} not found", entity.entity_type(), id),
            });
        }
        Ok(id.to_string())
    }
}

fn matches_params(entity: &Entity, params: &QueryParams) -> bool {
    params.iter().all(|(name, expected)| match entity.attribute(name) {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == *expected,
        None => false,
    })
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn create(&self, entity: &Entity) -> FlushResult<Entity> {
        self.write(RemoteOperation::Create, entity, || {
            self.check_references(entity)?;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
            self.confirm(entity, id)
        })
        .await
    }

    async fn update(&self, entity: &Entity) -> FlushResult<Entity> {
        self.write(RemoteOperation::Update, entity, || {
            let id = self.existing_id(entity)?;
            self.check_references(entity)?;
            self.confirm(entity, id)
        })
        .await
    }

    async fn delete(&self, entity: &Entity) -> FlushResult<Entity> {
        self.write(RemoteOperation::Delete, entity, || {
            let id = self.existing_id(entity)?;
            self.records
                .write()
                .remove(&(entity.entity_type().clone(), id));
            self.identity_map.evict(entity.client_id());
            let mut deleted = entity.clone();
            deleted.mark_deleted();
            Ok(deleted)
        })
        .await
    }

    async fn find(&self, entity_type: &EntityType, id: &str) -> FlushResult<Entity> {
        self.log(CallPhase::Started, RemoteOperation::Find, entity_type, None);
        self.wait(entity_type).await;
        let result = self.record(entity_type, id).ok_or_else(|| FlushError::MissingRecord {
            entity_type: entity_type.clone(),
            id: id.to_string(),
        });
        if let Ok(record) = &result {
            self.identity_map.upsert(record)?;
        }
        let phase = if result.is_ok() {
            CallPhase::Finished
        } else {
            CallPhase::Failed
        };
        self.log(phase, RemoteOperation::Find, entity_type, None);
        result
    }

    async fn query(
        &self,
        entity_type: &EntityType,
        params: &QueryParams,
    ) -> FlushResult<Vec<Entity>> {
        self.log(CallPhase::Started, RemoteOperation::Query, entity_type, None);
        self.wait(entity_type).await;
        let records: Vec<Entity> = self
            .records
            .read()
            .iter()
            .filter(|((t, _), record)| t == entity_type && matches_params(record, params))
            .map(|(_, record)| record.clone())
            .collect();
        for record in &records {
            self.identity_map.upsert(record)?;
        }
        self.log(CallPhase::Finished, RemoteOperation::Query, entity_type, None);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relsync_model::{EntityDef, Schema};

    fn session() -> Session {
        Session::new(Arc::new(
            Schema::new()
                .with_type(EntityDef::new("post").attribute("title").has_many("comments", "comment"))
                .with_type(EntityDef::new("comment").attribute("body").belongs_to("post", "post")),
        ))
    }

    #[tokio::test]
    async fn create_assigns_ids_and_drops_collections() {
        let session = session();
        let store = MemoryRemoteStore::new(&session);
        let post = session.create(&"post".into()).unwrap();
        session
            .batch(post, |p| {
                p.set_attribute("title", "A");
                p.add_to_has_many("comments", ClientId::new(99))
            })
            .unwrap();

        let created = store.create(&session.get(post).unwrap()).await.unwrap();
        assert_eq!(created.id(), Some("1"));
        assert!(!created.is_new());
        assert!(created.has_many("comments").is_empty());
        assert_eq!(session.identity_map().lookup(&"post".into(), "1"), Some(post));
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn create_with_unpersisted_parent_is_rejected() {
        let session = session();
        let store = MemoryRemoteStore::new(&session);
        let post = session.create(&"post".into()).unwrap();
        let comment = session.create(&"comment".into()).unwrap();
        session.set_belongs_to(comment, "post", Some(post)).unwrap();

        let result = store.create(&session.get(comment).unwrap()).await;
        assert!(matches!(
            result,
            Err(FlushError::UnresolvedReference { ref relationship, .. }) if relationship == "post"
        ));
        let key = session.get(comment).unwrap().key().clone();
        assert!(store.sequence_of(&key, CallPhase::Failed).is_some());
    }

    #[tokio::test]
    async fn scripted_validation_failure() {
        let session = session();
        let store = MemoryRemoteStore::new(&session);
        store.fail(
            "post",
            ScriptedFailure::Validation(ValidationErrors::new().with("title", "can't be blank")),
        );
        let post = session.create(&"post".into()).unwrap();

        let err = store.create(&session.get(post).unwrap()).await.unwrap_err();
        assert!(err.validation_errors().unwrap().has("title"));
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn find_and_query_seeded_records() {
        let session = session();
        let store = MemoryRemoteStore::new(&session);
        let def = session.schema().entity(&"post".into()).unwrap().clone();
        for (id, title) in [("10", "A"), ("11", "B")] {
            let mut post = Entity::persisted(&def, session.identity_map().allocate(), id);
            post.set_attribute("title", title);
            store.seed(&post).unwrap();
        }

        let found = store.find(&"post".into(), "11").await.unwrap();
        assert_eq!(found.attribute("title"), Some(&Value::from("B")));

        let missing = store.find(&"post".into(), "12").await;
        assert!(matches!(missing, Err(FlushError::MissingRecord { .. })));

        let params = QueryParams::from([("title".to_string(), "A".to_string())]);
        let results = store.query(&"post".into(), &params).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id(), Some("10"));
    }

    #[tokio::test]
    async fn delete_unknown_record_is_not_found() {
        let session = session();
        let store = MemoryRemoteStore::new(&session);
        let def = session.schema().entity(&"post".into()).unwrap().clone();
        let post = Entity::persisted(&def, session.identity_map().allocate(), "77");

        match store.delete(&post).await {
            Err(FlushError::Remote { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
