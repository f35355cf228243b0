//! Simulate command implementation.

use crate::fixture::{Fixture, LoadedFixture};
use relsync_engine::{
    CallEvent, FailurePolicy, FlushConfig, FlushEngine, MemoryRemoteStore, ScriptedFailure,
};
use relsync_model::{ClientId, Entity, Relationship, ValidationErrors};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Options of the simulate command.
#[derive(Debug, Clone, Default)]
pub struct SimulateOptions {
    /// Latency of every store call, in milliseconds.
    pub latency_ms: u64,
    /// Scripted validation failures as `type:field`.
    pub failures: Vec<String>,
    /// Echo has-many collections in store responses.
    pub echo_has_many: bool,
    /// Stop pending subtrees after the first failure.
    pub cancel_pending: bool,
}

/// An entity as reported after the simulation.
#[derive(Debug, Serialize)]
pub struct EntitySummary {
    /// Fixture ref.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Entity key.
    pub entity: String,
    /// Server id.
    pub id: Option<String>,
    /// Whether the entity was deleted.
    pub deleted: bool,
    /// Attributes.
    pub attributes: BTreeMap<String, Value>,
    /// Has-many members, by ref.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub collections: BTreeMap<String, Vec<String>>,
    /// Validation errors.
    #[serde(skip_serializing_if = "ValidationErrors::is_empty")]
    pub errors: ValidationErrors,
}

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulationResult {
    /// Whether the flush succeeded.
    pub success: bool,
    /// First error, if the flush failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Entities the flush touched.
    pub entities: Vec<EntitySummary>,
    /// Entities left with validation errors.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<EntitySummary>,
    /// Store call log.
    pub calls: Vec<CallEvent>,
}

/// Runs the simulate command.
pub fn run(
    path: &Path,
    options: &SimulateOptions,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let loaded = Fixture::from_path(path)?.load()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(simulate(&loaded, options))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    match result.error {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

/// Flushes a loaded fixture against a fresh in-memory store.
pub async fn simulate(
    loaded: &LoadedFixture,
    options: &SimulateOptions,
) -> Result<SimulationResult, Box<dyn std::error::Error>> {
    let session = &loaded.session;
    let store = MemoryRemoteStore::new(session)
        .with_latency(Duration::from_millis(options.latency_ms));
    store.set_echo_has_many(options.echo_has_many);
    for record in &loaded.server_records {
        store.seed(record)?;
    }
    for failure in &options.failures {
        let (entity_type, field) = failure
            .split_once(':')
            .ok_or_else(|| format!("invalid failure {failure:?}, expected TYPE:FIELD"))?;
        store.fail(
            entity_type,
            ScriptedFailure::Validation(ValidationErrors::new().with(field, "is invalid")),
        );
    }

    let policy = if options.cancel_pending {
        FailurePolicy::CancelPending
    } else {
        FailurePolicy::AwaitAll
    };
    let engine = FlushEngine::new(FlushConfig::new().with_failure_policy(policy), store);

    let (entities, error) = match engine.flush(session).await {
        Ok(report) => {
            info!(duration = ?report.duration, "simulation finished");
            (report.entities, None)
        }
        Err(failure) => (failure.partial, Some(failure.error.to_string())),
    };

    let rejected = session
        .entities()
        .iter()
        .filter(|e| !e.errors().is_empty())
        .map(|e| summarize(loaded, e))
        .collect();

    Ok(SimulationResult {
        success: error.is_none(),
        error,
        entities: entities.iter().map(|e| summarize(loaded, e)).collect(),
        rejected,
        calls: engine.store().calls(),
    })
}

fn summarize(loaded: &LoadedFixture, entity: &Entity) -> EntitySummary {
    let name = |cid: ClientId| loaded.reference(cid).unwrap_or("-").to_string();
    let collections = entity
        .relationships()
        .filter_map(|(rel, value)| match value {
            Relationship::HasMany(members) if !members.is_empty() => {
                Some((rel.to_string(), members.iter().map(|&m| name(m)).collect()))
            }
            _ => None,
        })
        .collect();

    EntitySummary {
        reference: name(entity.client_id()),
        entity: entity.key().to_string(),
        id: entity.id().map(str::to_string),
        deleted: entity.is_deleted(),
        attributes: entity.attributes().clone(),
        collections,
        errors: entity.errors().clone(),
    }
}

fn print_text_output(result: &SimulationResult) {
    println!("=== Simulation ===");
    println!("Store calls: {}", result.calls.len());
    println!();

    for entity in &result.entities {
        let state = if entity.deleted { "deleted" } else { "persisted" };
        println!(
            "  {:<12} {:<16} id={:<6} {}",
            entity.reference,
            entity.entity,
            entity.id.as_deref().unwrap_or("-"),
            state
        );
        for (name, members) in &entity.collections {
            println!("      {name}: {}", members.join(", "));
        }
    }

    for entity in &result.rejected {
        println!("  {:<12} {:<16} rejected: {}", entity.reference, entity.entity, entity.errors);
    }

    println!();
    match &result.error {
        Some(error) => println!("Result: FAILED ({error})"),
        None => println!("Result: OK"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOG: &str = include_str!("../../fixtures/blog.json");

    fn loaded() -> LoadedFixture {
        Fixture::parse(BLOG).unwrap().load().unwrap()
    }

    #[tokio::test]
    async fn blog_fixture_flushes() {
        let loaded = loaded();
        let result = simulate(&loaded, &SimulateOptions::default()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.entities.len(), 5);
        assert!(result.rejected.is_empty());

        let stale = result.entities.iter().find(|e| e.reference == "stale").unwrap();
        assert!(stale.deleted);

        let post1 = result.entities.iter().find(|e| e.reference == "post1").unwrap();
        assert_eq!(post1.collections.get("comments"), Some(&vec!["c1".to_string()]));
        let alice = result.entities.iter().find(|e| e.reference == "alice").unwrap();
        assert_eq!(alice.collections.get("posts"), Some(&vec!["draft".to_string()]));
    }

    #[tokio::test]
    async fn scripted_failure_is_reported() {
        let loaded = loaded();
        let options = SimulateOptions {
            failures: vec!["user:name".to_string()],
            ..SimulateOptions::default()
        };
        let result = simulate(&loaded, &options).await.unwrap();

        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].reference, "alice");
        assert!(result.rejected[0].errors.has("name"));

        // The draft waits on alice and is never sent
        assert!(result.entities.iter().all(|e| e.reference != "draft"));
        assert!(result.entities.iter().any(|e| e.reference == "c1"));
    }

    #[tokio::test]
    async fn malformed_failure_is_an_error() {
        let loaded = loaded();
        let options = SimulateOptions {
            failures: vec!["user".to_string()],
            ..SimulateOptions::default()
        };
        assert!(simulate(&loaded, &options).await.is_err());
    }
}
