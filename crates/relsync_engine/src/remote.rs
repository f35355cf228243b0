//! Remote store abstraction.

use crate::error::FlushResult;
use async_trait::async_trait;
use relsync_model::{Entity, EntityType};
use std::collections::BTreeMap;

/// Parameters passed through to bulk reads.
pub type QueryParams = BTreeMap<String, String>;

/// A remote store persists entities and returns their canonical,
/// server-confirmed representation.
///
/// Implementations merge every record they receive into the identity map
/// before returning, so callers only ever see entities whose server state
/// is already recorded. Implemented over HTTP by [`crate::RestAdapter`]
/// and in memory by [`crate::MemoryRemoteStore`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Creates the entity. The result carries the server-assigned id.
    async fn create(&self, entity: &Entity) -> FlushResult<Entity>;

    /// Updates the entity.
    async fn update(&self, entity: &Entity) -> FlushResult<Entity>;

    /// Deletes the entity. The result is marked deleted.
    async fn delete(&self, entity: &Entity) -> FlushResult<Entity>;

    /// Fetches a single record.
    async fn find(&self, entity_type: &EntityType, id: &str) -> FlushResult<Entity>;

    /// Fetches all records of a type matching the parameters.
    async fn query(
        &self,
        entity_type: &EntityType,
        params: &QueryParams,
    ) -> FlushResult<Vec<Entity>>;
}
