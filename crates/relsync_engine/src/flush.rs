//! Flush orchestration.
//!
//! A flush walks the dependency forest of a session: every root subtree
//! runs concurrently, a node's remote operation completes before any of
//! its children start, and siblings run concurrently with each other.
//! Nothing is spawned; all work is composed with `futures` inside the
//! caller's task, and no lock is held across an await point.

use crate::config::{FailurePolicy, FlushConfig};
use crate::error::{FlushError, FlushFailure, FlushResult};
use crate::graph::{DependencyGraph, DependencyNode, NodeId, Operation};
use crate::reconcile::rebuild_relationships;
use crate::remote::RemoteStore;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::{Future, FutureExt};
use parking_lot::{Mutex, RwLock};
use relsync_model::{ClientId, Entity, ModelError, Session};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Outcome of a successful flush.
#[derive(Debug, Clone)]
pub struct FlushReport {
    /// Every entity the flush touched, in its final state. Order is not
    /// significant.
    ///
    /// Besides the entities the remote store confirmed, this holds parents
    /// whose has-many collections were repaired after a child persisted.
    /// Such a parent may have been clean, with no remote call of its own.
    pub entities: Vec<Entity>,
    /// Wall time of the flush.
    pub duration: Duration,
}

impl FlushReport {
    /// Returns true if nothing was sent.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Returns the entity with the given local identity.
    pub fn entity(&self, client_id: ClientId) -> Option<&Entity> {
        self.entities.iter().find(|e| e.client_id() == client_id)
    }
}

/// Counters across the flushes of one engine.
#[derive(Debug, Clone, Default)]
pub struct FlushStats {
    /// Flushes that completed without error.
    pub flushes_completed: u64,
    /// Flushes that failed.
    pub flushes_failed: u64,
    /// Remote operations that succeeded.
    pub operations_sent: u64,
    /// Last flush time.
    pub last_flush_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Flushes sessions against a remote store.
pub struct FlushEngine<S: RemoteStore> {
    config: FlushConfig,
    store: S,
    stats: RwLock<FlushStats>,
}

impl<S: RemoteStore> FlushEngine<S> {
    /// Creates an engine.
    pub fn new(config: FlushConfig, store: S) -> Self {
        Self {
            config,
            store,
            stats: RwLock::new(FlushStats::default()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    /// Returns the remote store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the statistics.
    pub fn stats(&self) -> FlushStats {
        self.stats.read().clone()
    }

    /// Persists every dirty entity of the session in dependency order.
    ///
    /// On failure the first error observed is returned together with the
    /// entities persisted so far. Work already dispatched is never rolled
    /// back, so the session may be left partially persisted.
    pub async fn flush(&self, session: &Session) -> Result<FlushReport, FlushFailure> {
        let started = Instant::now();

        let graph = match DependencyGraph::build(session) {
            Ok(graph) => graph,
            Err(e) => {
                error!(error = %e, "flush aborted before sending anything");
                self.record_failure(&e);
                return Err(FlushFailure::new(e));
            }
        };

        info!(
            nodes = graph.len(),
            dirty = graph.dirty_count(),
            roots = graph.roots().len(),
            "flushing session"
        );

        let run = FlushRun::new(session, &self.store, &graph, &self.config);
        let outcome = run
            .run_all(graph.roots().iter().map(|&root| run.run_node(root, None)))
            .await;
        let sent = run.operations_sent();
        let entities = run.into_entities();

        self.stats.write().operations_sent += sent;
        match outcome {
            Ok(_) => {
                let duration = started.elapsed();
                info!(entities = entities.len(), ?duration, "flush complete");
                {
                    let mut stats = self.stats.write();
                    stats.flushes_completed += 1;
                    stats.last_flush_time = Some(Instant::now());
                    stats.last_error = None;
                }
                Ok(FlushReport { entities, duration })
            }
            Err(e) => {
                error!(error = %e, persisted = entities.len(), "flush failed");
                self.record_failure(&e);
                Err(FlushFailure {
                    error: e,
                    partial: entities,
                })
            }
        }
    }

    fn record_failure(&self, error: &FlushError) {
        let mut stats = self.stats.write();
        stats.flushes_failed += 1;
        stats.last_flush_time = Some(Instant::now());
        stats.last_error = Some(error.to_string());
    }
}

/// State of one flush call.
struct FlushRun<'a, S: RemoteStore> {
    session: &'a Session,
    store: &'a S,
    graph: &'a DependencyGraph,
    config: &'a FlushConfig,
    /// Dirty parents each node still waits for.
    waiting_on: Mutex<HashMap<NodeId, usize>>,
    /// Cumulative results keyed by local identity.
    results: Mutex<BTreeMap<ClientId, Entity>>,
    sent: AtomicU64,
}

impl<'a, S: RemoteStore> FlushRun<'a, S> {
    fn new(
        session: &'a Session,
        store: &'a S,
        graph: &'a DependencyGraph,
        config: &'a FlushConfig,
    ) -> Self {
        let waiting_on = graph
            .nodes()
            .map(|(id, node)| {
                let dirty_parents = node
                    .parents()
                    .iter()
                    .filter(|&&p| graph.node(p).is_dirty())
                    .count();
                (id, dirty_parents)
            })
            .collect();

        Self {
            session,
            store,
            graph,
            config,
            waiting_on: Mutex::new(waiting_on),
            results: Mutex::new(BTreeMap::new()),
            sent: AtomicU64::new(0),
        }
    }

    fn operations_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    fn into_entities(self) -> Vec<Entity> {
        self.results.into_inner().into_values().collect()
    }

    fn record(&self, entity: &Entity) {
        self.results.lock().insert(entity.client_id(), entity.clone());
    }

    /// Drives futures to completion and collects their results.
    ///
    /// The first error in completion order wins. Under
    /// [`FailurePolicy::CancelPending`] the remaining futures are dropped
    /// as soon as it is observed.
    async fn run_all<F, I>(&self, futures: I) -> FlushResult<Vec<Entity>>
    where
        F: Future<Output = FlushResult<Entity>>,
        I: IntoIterator<Item = F>,
    {
        let mut pending: FuturesUnordered<_> = futures.into_iter().collect();
        let mut results = Vec::with_capacity(pending.len());
        let mut first_error = None;

        while let Some(outcome) = pending.next().await {
            match outcome {
                Ok(entity) => results.push(entity),
                Err(e) if first_error.is_some() => {
                    debug!(error = %e, "additional failure in flush");
                }
                Err(e) => {
                    first_error = Some(e);
                    if self.config.failure_policy == FailurePolicy::CancelPending {
                        if !pending.is_empty() {
                            warn!(cancelled = pending.len(), "cancelling pending subtrees");
                        }
                        break;
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Runs one node and, once it is persisted, the children it releases.
    ///
    /// `dispatcher` is the parent that released this node, if any.
    fn run_node<'r>(
        &'r self,
        id: NodeId,
        dispatcher: Option<NodeId>,
    ) -> BoxFuture<'r, FlushResult<Entity>> {
        async move {
            let node = self.graph.node(id);
            let entity = self.execute(node).await?;

            if self.config.reconcile_relationships && !entity.is_deleted() {
                self.reconcile_other_parents(node, dispatcher, &entity)?;
            }

            let ready = self.release_children(node);
            if ready.is_empty() {
                return Ok(entity);
            }

            let children = self
                .run_all(ready.into_iter().map(|child| self.run_node(child, Some(id))))
                .await?;

            if !self.config.reconcile_relationships {
                return Ok(entity);
            }
            let repaired = rebuild_relationships(self.session, &children, &entity)?;
            if self.session.contains(repaired.client_id()) {
                self.record(&repaired);
            }
            Ok(repaired)
        }
        .boxed()
    }

    /// Issues the node's remote operation and merges the response.
    async fn execute(&self, node: &DependencyNode) -> FlushResult<Entity> {
        let client_id = node.client_id();
        let entity = self
            .session
            .get(client_id)
            .ok_or(ModelError::EntityNotFound(client_id))?;

        let operation = node.operation();
        let response = match operation {
            Operation::None => return Ok(entity),
            Operation::Create => self.store.create(&entity).await,
            Operation::Update => self.store.update(&entity).await,
            Operation::Delete => self.store.delete(&entity).await,
        };

        match response {
            Ok(confirmed) => {
                debug!(
                    entity = %node.key(),
                    operation = operation.as_str(),
                    id = confirmed.id().unwrap_or_default(),
                    "remote operation complete"
                );
                self.sent.fetch_add(1, Ordering::SeqCst);
                let merged = self.session.merge(confirmed)?;
                self.record(&merged);
                Ok(merged)
            }
            Err(FlushError::Validation { entity: key, errors }) => {
                warn!(entity = %key, %errors, "remote store rejected entity");
                self.session.attach_errors(client_id, errors.clone())?;
                Err(FlushError::Validation { entity: key, errors })
            }
            Err(e) => {
                debug!(
                    entity = %node.key(),
                    operation = operation.as_str(),
                    error = %e,
                    "remote operation failed"
                );
                Err(e)
            }
        }
    }

    /// Counts down the children of a persisted node and returns those
    /// whose dirty parents are now all persisted.
    fn release_children(&self, node: &DependencyNode) -> Vec<NodeId> {
        let mut waiting_on = self.waiting_on.lock();
        node.children()
            .iter()
            .copied()
            .filter(|child| match waiting_on.get_mut(child) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    *remaining == 0
                }
                _ => false,
            })
            .collect()
    }

    /// Mirrors a persisted node into the collections of parents other than
    /// the one that dispatched it. Those parents completed earlier and
    /// will not see this node among their children's results.
    fn reconcile_other_parents(
        &self,
        node: &DependencyNode,
        dispatcher: Option<NodeId>,
        entity: &Entity,
    ) -> FlushResult<()> {
        for &parent in node.parents() {
            if Some(parent) == dispatcher {
                continue;
            }
            let parent_id = self.graph.node(parent).client_id();
            let Some(current) = self.session.get(parent_id) else {
                continue;
            };
            let before = current.clone();
            let repaired =
                rebuild_relationships(self.session, std::slice::from_ref(entity), &current)?;
            if repaired != before {
                self.record(&repaired);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CallPhase, MemoryRemoteStore, ScriptedFailure};
    use relsync_model::{EntityDef, Schema, ValidationErrors};
    use std::sync::Arc;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new()
                .with_type(EntityDef::new("user").attribute("name").has_many("comments", "comment"))
                .with_type(EntityDef::new("post").attribute("title").has_many("comments", "comment"))
                .with_type(
                    EntityDef::new("comment")
                        .attribute("body")
                        .belongs_to("post", "post")
                        .belongs_to("author", "user"),
                ),
        )
    }

    #[tokio::test]
    async fn empty_session_flushes_to_empty_report() {
        let session = Session::new(schema());
        let engine = FlushEngine::new(FlushConfig::default(), MemoryRemoteStore::new(&session));

        let report = engine.flush(&session).await.unwrap();
        assert!(report.is_empty());
        assert!(engine.store().calls().is_empty());
        assert_eq!(engine.stats().flushes_completed, 1);
    }

    #[tokio::test]
    async fn child_with_two_new_parents_is_sent_once_after_both() {
        let session = Session::new(schema());
        let engine = FlushEngine::new(FlushConfig::default(), MemoryRemoteStore::new(&session));

        let post = session.create(&"post".into()).unwrap();
        let user = session.create(&"user".into()).unwrap();
        let comment = session.create(&"comment".into()).unwrap();
        session.set_belongs_to(comment, "post", Some(post)).unwrap();
        session.set_belongs_to(comment, "author", Some(user)).unwrap();

        let report = engine.flush(&session).await.unwrap();
        assert_eq!(report.entities.len(), 3);

        let store = engine.store();
        assert_eq!(store.write_count(), 3);
        let key = |cid: ClientId| session.get(cid).unwrap().key().clone();
        let comment_start = store.sequence_of(&key(comment), CallPhase::Started).unwrap();
        for parent in [post, user] {
            let parent_done = store.sequence_of(&key(parent), CallPhase::Finished).unwrap();
            assert!(parent_done < comment_start);
        }

        // Both parents see the comment, whichever released it.
        assert_eq!(session.get(post).unwrap().has_many("comments"), &[comment]);
        assert_eq!(session.get(user).unwrap().has_many("comments"), &[comment]);
        assert!(DependencyGraph::build(&session).unwrap().roots().is_empty());
    }

    #[tokio::test]
    async fn failed_parent_skips_its_children() {
        let session = Session::new(schema());
        let store = MemoryRemoteStore::new(&session);
        store.fail(
            "post",
            ScriptedFailure::Validation(ValidationErrors::new().with("title", "can't be blank")),
        );
        let engine = FlushEngine::new(FlushConfig::default(), store);

        let post = session.create(&"post".into()).unwrap();
        let comment = session.create(&"comment".into()).unwrap();
        session.set_belongs_to(comment, "post", Some(post)).unwrap();

        let failure = engine.flush(&session).await.unwrap_err();
        assert!(failure.error.validation_errors().is_some());
        assert!(failure.partial.is_empty());
        assert!(session.get(post).unwrap().errors().has("title"));
        assert!(session.get(comment).unwrap().is_new());
        assert_eq!(engine.store().write_count(), 1);

        let stats = engine.stats();
        assert_eq!(stats.flushes_failed, 1);
        assert!(stats.last_error.is_some());
    }

    #[tokio::test]
    async fn repaired_clean_parent_is_reported_without_a_call() {
        let session = Session::new(schema());
        let store = MemoryRemoteStore::new(&session);
        let def = session.schema().entity(&"post".into()).unwrap().clone();
        let post = Entity::persisted(&def, session.identity_map().allocate(), "1");
        store.seed(&post).unwrap();
        let post = session.track(post).unwrap();
        let engine = FlushEngine::new(FlushConfig::default(), store);

        let comment = session.create(&"comment".into()).unwrap();
        session.set_belongs_to(comment, "post", Some(post)).unwrap();

        let report = engine.flush(&session).await.unwrap();
        assert_eq!(engine.store().write_count(), 1);
        assert_eq!(engine.stats().operations_sent, 1);
        assert_eq!(report.entities.len(), 2);
        assert_eq!(report.entity(post).unwrap().has_many("comments"), &[comment]);
    }

    #[tokio::test]
    async fn reconciliation_can_be_disabled() {
        let session = Session::new(schema());
        let engine = FlushEngine::new(
            FlushConfig::new().with_reconcile_relationships(false),
            MemoryRemoteStore::new(&session),
        );

        let post = session.create(&"post".into()).unwrap();
        let comment = session.create(&"comment".into()).unwrap();
        session.set_belongs_to(comment, "post", Some(post)).unwrap();

        engine.flush(&session).await.unwrap();
        assert!(session.get(post).unwrap().has_many("comments").is_empty());
    }
}
