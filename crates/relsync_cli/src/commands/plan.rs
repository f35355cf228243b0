//! Plan command implementation.

use crate::fixture::{Fixture, LoadedFixture};
use relsync_engine::{DependencyGraph, NodeId};
use serde::Serialize;
use std::path::Path;

/// A node of the printed dependency forest.
#[derive(Debug, Serialize)]
pub struct PlanNode {
    /// Fixture ref.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Entity key.
    pub entity: String,
    /// Remote operation.
    pub operation: &'static str,
    /// Dependent nodes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<PlanNode>,
}

/// The dependency forest of a fixture.
#[derive(Debug, Serialize)]
pub struct Plan {
    /// Total number of nodes.
    pub nodes: usize,
    /// Number of dirty nodes.
    pub dirty: usize,
    /// Root subtrees.
    pub roots: Vec<PlanNode>,
}

/// Runs the plan command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let loaded = Fixture::from_path(path)?.load()?;
    let plan = build_plan(&loaded)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        _ => {
            print_text_output(&plan);
        }
    }

    Ok(())
}

/// Builds the dependency forest of a loaded fixture.
pub fn build_plan(loaded: &LoadedFixture) -> Result<Plan, Box<dyn std::error::Error>> {
    let graph = DependencyGraph::build(&loaded.session)?;
    Ok(Plan {
        nodes: graph.len(),
        dirty: graph.dirty_count(),
        roots: graph
            .roots()
            .iter()
            .map(|&root| plan_node(&graph, loaded, root))
            .collect(),
    })
}

fn plan_node(graph: &DependencyGraph, loaded: &LoadedFixture, id: NodeId) -> PlanNode {
    let node = graph.node(id);
    PlanNode {
        reference: loaded
            .reference(node.client_id())
            .unwrap_or("-")
            .to_string(),
        entity: node.key().to_string(),
        operation: node.operation().as_str(),
        children: node
            .children()
            .iter()
            .map(|&child| plan_node(graph, loaded, child))
            .collect(),
    }
}

fn print_text_output(plan: &Plan) {
    println!(
        "{} nodes, {} dirty, {} roots",
        plan.nodes,
        plan.dirty,
        plan.roots.len()
    );
    for root in &plan.roots {
        print_node(root, 0);
    }
}

fn print_node(node: &PlanNode, depth: usize) {
    println!(
        "{:indent$}{} ({}) {}",
        "",
        node.reference,
        node.entity,
        node.operation,
        indent = depth * 2
    );
    for child in &node.children {
        print_node(child, depth + 1);
    }
}
