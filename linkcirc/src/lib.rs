//! Quantum circuits persisted as linked gate graphs, rewritten concurrently
//! in place.
//!
//! A circuit is flattened into a table of [`GateNode`]s, one row per
//! operation plus `In`/`Out` sentinels at the ends of every wire. Each node
//! stores, per port, a link to the previous and the next node on the wire
//! passing through it. That doubly-linked layout lets many rewrite workers
//! edit different regions of the same circuit at the same time, each in its
//! own short transaction, without ever loading the whole circuit in memory.
//!
//! The crate provides:
//!
//! - [`ingest`]: translating a native circuit into linked nodes, either all
//!   at once or in bounded windows streamed into a [`GraphStore`].
//! - [`reconstruct`]: the inverse, rebuilding a moment-ordered circuit from
//!   stored nodes.
//! - [`rewrite`]: textual procedure invocations and the built-in
//!   inverse-pair cancellation.
//! - [`optimiser`]: an orchestrator running many rewrite workers against one
//!   store under a global timeout.
//! - [`passes`]: clustering of operations into resource-bounded widgets.
//!
//! # Example
//!
//! ```
//! use linkcirc::ingest::{ingest_into_store, IngestOptions};
//! use linkcirc::rewrite::{ProcedureExecutor, ProcedureRegistry};
//! use linkcirc::serialize::{DirectTranslator, GateSpec};
//! use linkcirc::{GateCode, GraphStore};
//!
//! let mut store = GraphStore::open_in_memory()?;
//! let ops = [
//!     GateSpec::new(GateCode::H, [0]),
//!     GateSpec::new(GateCode::H, [0]),
//!     GateSpec::new(GateCode::CX, [0, 1]),
//! ];
//! ingest_into_store(&mut store, &DirectTranslator, &ops, &IngestOptions::default())?;
//!
//! // Cancel the two Hadamards.
//! let outcome = ProcedureRegistry::with_builtins()
//!     .invoke(&mut store, "cancel_inverse_pairs_block(0, 'H', 100, 10, 0, 1, 5.0)")?;
//! assert_eq!(outcome.applied, 1);
//! assert_eq!(store.count_operations(0)?, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod circuit;
pub mod ingest;
pub mod link;
pub mod ops;
pub mod optimiser;
pub mod passes;
pub mod reconstruct;
pub mod rewrite;
pub mod serialize;
pub mod store;

mod utils;

pub use circuit::{GateNode, InvariantViolation, Label, LinkedCircuit};
pub use link::{GateId, Link, Port};
pub use ops::GateCode;
pub use optimiser::{OptimisationOrchestrator, OrchestratorOptions};
pub use store::{GraphStore, StoreConfig, StoreError};
