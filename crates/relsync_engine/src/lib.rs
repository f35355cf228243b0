//! # relsync engine
//!
//! Dependency-ordered flushing of relsync sessions to a remote store.
//!
//! This crate provides:
//! - The dependency graph over a session's dirty entities
//! - The flush orchestrator, which persists parents before their children
//!   and runs independent subtrees concurrently
//! - The relationship reconciler, which repairs parent collections after
//!   children are persisted
//! - A remote store abstraction with a REST adapter and an in-memory store
//!
//! ## Ordering
//!
//! An entity referencing another through a belongs-to relationship is not
//! sent until the referenced entity has a server id. Every other pair of
//! operations may run concurrently.
//!
//! ## Failure
//!
//! A failing node rejects its own subtree only. The flush reports the
//! first error observed together with everything persisted so far; there
//! is no rollback.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod flush;
mod graph;
mod memory;
mod reconcile;
mod remote;
mod rest;
mod serializer;

pub use config::{AdapterConfig, FailurePolicy, FlushConfig};
pub use error::{FlushError, FlushFailure, FlushResult};
pub use flush::{FlushEngine, FlushReport, FlushStats};
pub use graph::{DependencyGraph, DependencyNode, NodeId, Operation};
pub use memory::{CallEvent, CallPhase, MemoryRemoteStore, RemoteOperation, ScriptedFailure};
pub use reconcile::rebuild_relationships;
pub use remote::{QueryParams, RemoteStore};
pub use rest::{HttpClient, HttpRequest, HttpResponse, Method, RestAdapter};
pub use serializer::JsonSerializer;
