//! Rewrite procedures applied in place to a stored circuit.
//!
//! Rewrite workers never look inside the procedures they run. They send a
//! textual [`Invocation`], such as
//! `cancel_inverse_pairs_bernoulli(0, 'H|CX', 10.0, 100, 0, 4, 30.0)`, to a
//! [`ProcedureExecutor`] together with their own store connection. The
//! executor shipped here, [`ProcedureRegistry`], parses the invocation and
//! dispatches it to a named [`Procedure`].
//!
//! Procedures must keep the graph invariants after each of their internal
//! iterations, poll the store's stop flag between iterations, and give up on
//! a match that a concurrent worker changed under them.

pub mod cancel;
pub mod invocation;

use std::collections::BTreeMap;
use std::sync::Arc;

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};

pub use cancel::CancelInversePairs;
pub use invocation::{Argument, Invocation};

use crate::circuit::InvariantViolation;
use crate::store::{GraphStore, StoreError};

/// What a procedure call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureOutcome {
    /// Rewrites applied.
    pub applied: usize,
    /// Internal iterations run.
    pub iterations: usize,
    /// Matches abandoned because another worker changed them first.
    pub conflicts: usize,
    /// Whether the call returned because the stop flag was set.
    pub stopped: bool,
}

/// Runs textual procedure invocations against a store.
pub trait ProcedureExecutor: Send + Sync {
    /// Run one invocation to completion.
    fn invoke(
        &self,
        store: &mut GraphStore,
        invocation: &str,
    ) -> Result<ProcedureOutcome, ProcedureError>;
}

/// A named rewrite procedure.
pub trait Procedure: Send + Sync {
    /// The name it is invoked by.
    fn name(&self) -> &str;

    /// Run the procedure with parsed arguments.
    fn call(
        &self,
        store: &mut GraphStore,
        invocation: &Invocation,
    ) -> Result<ProcedureOutcome, ProcedureError>;
}

/// Procedures indexed by name.
#[derive(Clone, Default)]
pub struct ProcedureRegistry {
    procedures: BTreeMap<String, Arc<dyn Procedure>>,
}

impl ProcedureRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in procedures.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(CancelInversePairs::bernoulli());
        registry.register(CancelInversePairs::block());
        registry
    }

    /// Add a procedure, replacing any procedure with the same name.
    pub fn register(&mut self, procedure: impl Procedure + 'static) {
        self.procedures
            .insert(procedure.name().to_string(), Arc::new(procedure));
    }

    /// Names of the registered procedures.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.procedures.keys().map(String::as_str)
    }

    /// Look up a procedure.
    pub fn get(&self, name: &str) -> Option<&dyn Procedure> {
        self.procedures.get(name).map(|p| p.as_ref())
    }
}

impl std::fmt::Debug for ProcedureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureRegistry")
            .field("procedures", &self.procedures.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProcedureExecutor for ProcedureRegistry {
    fn invoke(
        &self,
        store: &mut GraphStore,
        invocation: &str,
    ) -> Result<ProcedureOutcome, ProcedureError> {
        let invocation: Invocation = invocation.parse()?;
        let procedure = self
            .get(&invocation.name)
            .ok_or_else(|| ProcedureError::UnknownProcedure {
                name: invocation.name.clone(),
            })?;
        procedure.call(store, &invocation)
    }
}

/// Errors raised by procedure calls.
#[derive(Debug, Display, From, Error)]
#[non_exhaustive]
pub enum ProcedureError {
    /// No procedure with this name is registered.
    #[display("Unknown procedure {name}.")]
    #[from(ignore)]
    UnknownProcedure {
        /// The requested name.
        name: String,
    },
    /// The invocation could not be parsed or has bad arguments.
    #[display("Invalid invocation {invocation}: {reason}")]
    #[from(ignore)]
    InvalidInvocation {
        /// The invocation text.
        invocation: String,
        /// What was wrong.
        reason: String,
    },
    /// A store operation failed.
    Store(StoreError),
    /// The stored graph is not well formed.
    Invariant(InvariantViolation),
}

#[cfg(test)]
mod test {
    use super::*;
    use cool_asserts::assert_matches;

    #[test]
    fn builtins() {
        let registry = ProcedureRegistry::with_builtins();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            [
                "cancel_inverse_pairs_bernoulli",
                "cancel_inverse_pairs_block"
            ]
        );
    }

    #[test]
    fn unknown_procedure() {
        let registry = ProcedureRegistry::with_builtins();
        let mut store = GraphStore::open_in_memory().unwrap();
        assert_matches!(
            registry.invoke(&mut store, "merge_rotations(0)"),
            Err(ProcedureError::UnknownProcedure { name }) => assert_eq!(name, "merge_rotations")
        );
        assert_matches!(
            registry.invoke(&mut store, "no parentheses"),
            Err(ProcedureError::InvalidInvocation { .. })
        );
    }
}
