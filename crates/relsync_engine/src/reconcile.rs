//! Repairs parent-side collections after dependent children are persisted.
//!
//! A parent created in the same flush as its children is answered by the
//! remote store before the children exist, so its confirmed has-many
//! collections come back without them. Once the children are persisted,
//! each child's belongs-to is mirrored into the parent's inverse has-many.

use crate::error::FlushResult;
use relsync_model::{ClientId, Entity, ModelError, Relationship, RelationshipKind, Session};
use tracing::debug;

/// Adds every persisted child to the matching has-many collection of
/// `parent` and returns the repaired parent.
///
/// All additions land in one session change. The identity map snapshot of
/// the parent receives the same additions so the next diff sees no change.
/// A parent that has left the working set is returned as given. Deleted
/// children are skipped; removals are not mirrored.
pub fn rebuild_relationships(
    session: &Session,
    children: &[Entity],
    parent: &Entity,
) -> FlushResult<Entity> {
    let parent_id = parent.client_id();
    if !session.contains(parent_id) {
        return Ok(parent.clone());
    }

    let additions = pending_additions(session, children, parent_id);
    if !additions.is_empty() {
        session.batch(parent_id, |entity| {
            for (name, child) in &additions {
                entity.add_to_has_many(name, *child)?;
            }
            Ok(())
        })?;

        let identity_map = session.identity_map();
        if let Some(mut snapshot) = identity_map.snapshot(parent_id) {
            for (name, child) in &additions {
                snapshot.add_to_has_many(name, *child)?;
            }
            identity_map.upsert(&snapshot)?;
        }
        debug!(parent = %parent.key(), added = additions.len(), "rebuilt relationships");
    }

    Ok(session
        .get(parent_id)
        .ok_or(ModelError::EntityNotFound(parent_id))?)
}

fn pending_additions(
    session: &Session,
    children: &[Entity],
    parent_id: ClientId,
) -> Vec<(String, ClientId)> {
    let schema = session.schema();
    let current = session.get(parent_id);
    let mut additions = Vec::new();

    for child in children.iter().filter(|c| !c.is_deleted()) {
        for (name, relationship) in child.relationships() {
            if *relationship != Relationship::BelongsTo(Some(parent_id)) {
                continue;
            }
            let Some(inverse) = schema.inverse_for(child.entity_type(), name) else {
                continue;
            };
            if inverse.kind != RelationshipKind::HasMany {
                continue;
            }
            let present = current
                .as_ref()
                .is_some_and(|p| p.has_many(&inverse.name).contains(&child.client_id()));
            let entry = (inverse.name.clone(), child.client_id());
            if !present && !additions.contains(&entry) {
                additions.push(entry);
            }
        }
    }
    additions
}
