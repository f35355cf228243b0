//! Identity map: server identities, local identities and server snapshots.
//!
//! The identity map is the only state shared between concurrently running
//! flush branches. Every write is an upsert keyed by `(type, id)`, so
//! merges of different records commute and repeated merges of the same
//! response are idempotent.

use crate::entity::{ClientId, Entity};
use crate::error::{ModelError, ModelResult};
use crate::schema::EntityType;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    next_client_id: u64,
    by_server_id: HashMap<(EntityType, String), ClientId>,
    server_ids: HashMap<ClientId, String>,
    snapshots: HashMap<ClientId, Entity>,
}

impl Inner {
    fn allocate(&mut self) -> ClientId {
        self.next_client_id += 1;
        ClientId::new(self.next_client_id)
    }
}

/// Maps server identities to local identities and holds the last-known
/// server state of each persisted entity.
#[derive(Default)]
pub struct IdentityMap {
    inner: RwLock<Inner>,
}

impl IdentityMap {
    /// Creates an empty identity map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh local identity.
    pub fn allocate(&self) -> ClientId {
        self.inner.write().allocate()
    }

    /// Returns the local identity for a server record, allocating one if the
    /// record has not been seen before.
    pub fn client_id_for(&self, entity_type: &EntityType, id: &str) -> ClientId {
        let key = (entity_type.clone(), id.to_string());
        if let Some(client_id) = self.inner.read().by_server_id.get(&key) {
            return *client_id;
        }

        let mut inner = self.inner.write();
        if let Some(client_id) = inner.by_server_id.get(&key) {
            return *client_id;
        }
        let client_id = inner.allocate();
        inner.by_server_id.insert(key, client_id);
        inner.server_ids.insert(client_id, id.to_string());
        client_id
    }

    /// Returns the local identity of a server record, if known.
    pub fn lookup(&self, entity_type: &EntityType, id: &str) -> Option<ClientId> {
        self.inner
            .read()
            .by_server_id
            .get(&(entity_type.clone(), id.to_string()))
            .copied()
    }

    /// Associates a server id with an existing local identity.
    ///
    /// Used when the server assigns an id to a newly created entity.
    pub fn bind(&self, entity_type: &EntityType, id: &str, client_id: ClientId) {
        let mut inner = self.inner.write();
        inner
            .by_server_id
            .insert((entity_type.clone(), id.to_string()), client_id);
        inner.server_ids.insert(client_id, id.to_string());
    }

    /// Returns the server id bound to a local identity.
    pub fn server_id(&self, client_id: ClientId) -> Option<String> {
        self.inner.read().server_ids.get(&client_id).cloned()
    }

    /// Returns the last-known server state of an entity.
    pub fn snapshot(&self, client_id: ClientId) -> Option<Entity> {
        self.inner.read().snapshots.get(&client_id).cloned()
    }

    /// Returns the last-known server state of a record by server identity.
    pub fn get(&self, entity_type: &EntityType, id: &str) -> Option<Entity> {
        let inner = self.inner.read();
        let client_id = inner
            .by_server_id
            .get(&(entity_type.clone(), id.to_string()))?;
        inner.snapshots.get(client_id).cloned()
    }

    /// Records the server state of an entity.
    ///
    /// The stored snapshot is marked persisted and carries no validation
    /// errors. Fails if the entity has no server id.
    pub fn upsert(&self, entity: &Entity) -> ModelResult<()> {
        let id = entity.id().ok_or_else(|| ModelError::MissingServerId {
            entity_type: entity.entity_type().clone(),
            client_id: entity.client_id(),
        })?;

        let mut snapshot = entity.clone();
        snapshot.mark_persisted();
        snapshot.set_errors(Default::default());

        let mut inner = self.inner.write();
        inner
            .by_server_id
            .insert((entity.entity_type().clone(), id.to_string()), entity.client_id());
        inner.server_ids.insert(entity.client_id(), id.to_string());
        inner.snapshots.insert(entity.client_id(), snapshot);
        Ok(())
    }

    /// Forgets a record entirely (after a confirmed delete).
    pub fn evict(&self, client_id: ClientId) -> Option<Entity> {
        let mut inner = self.inner.write();
        if let Some(id) = inner.server_ids.remove(&client_id) {
            inner.by_server_id.retain(|(_, sid), cid| !(*cid == client_id && *sid == id));
        }
        inner.snapshots.remove(&client_id)
    }

    /// Returns the number of snapshots held.
    pub fn len(&self) -> usize {
        self.inner.read().snapshots.len()
    }

    /// Returns true if no snapshot is held.
    pub fn is_empty(&self) -> bool {
        self.inner.read().snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntityDef;
    use std::sync::Arc;
    use std::thread;

    fn post(client_id: ClientId, id: &str, title: &str) -> Entity {
        let mut post = Entity::persisted(&EntityDef::new("post"), client_id, id);
        post.set_attribute("title", title);
        post
    }

    #[test]
    fn client_ids_are_stable_per_server_record() {
        let map = IdentityMap::new();
        let a = map.client_id_for(&"post".into(), "1");
        let b = map.client_id_for(&"post".into(), "1");
        let c = map.client_id_for(&"comment".into(), "1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(map.server_id(a).as_deref(), Some("1"));
    }

    #[test]
    fn upsert_is_idempotent() {
        let map = IdentityMap::new();
        let client_id = map.allocate();
        let entity = post(client_id, "7", "A");

        map.upsert(&entity).unwrap();
        map.upsert(&entity).unwrap();

        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"post".into(), "7").unwrap(), entity);
        assert_eq!(map.lookup(&"post".into(), "7"), Some(client_id));
    }

    #[test]
    fn upsert_requires_server_id() {
        let map = IdentityMap::new();
        let entity = Entity::new(&EntityDef::new("post"), map.allocate());
        assert!(matches!(
            map.upsert(&entity),
            Err(ModelError::MissingServerId { .. })
        ));
    }

    #[test]
    fn bind_then_evict() {
        let map = IdentityMap::new();
        let client_id = map.allocate();
        map.bind(&"post".into(), "3", client_id);
        map.upsert(&post(client_id, "3", "A")).unwrap();

        assert!(map.evict(client_id).is_some());
        assert!(map.snapshot(client_id).is_none());
        assert!(map.lookup(&"post".into(), "3").is_none());
    }

    #[test]
    fn concurrent_upserts_of_distinct_records_commute() {
        let map = Arc::new(IdentityMap::new());
        let ids: Vec<_> = (0..8).map(|_| map.allocate()).collect();

        let handles: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, &client_id)| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    map.upsert(&post(client_id, &i.to_string(), "x")).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.len(), 8);
        for (i, client_id) in ids.into_iter().enumerate() {
            assert_eq!(map.lookup(&"post".into(), &i.to_string()), Some(client_id));
        }
    }
}
