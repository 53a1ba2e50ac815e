//! Declarative descriptions of what rewrite workers should run.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::circuit::Label;
use crate::ops::GateCode;
use crate::rewrite::{Argument, Invocation};

/// Run count used when a procedure should keep going until the timeout.
pub const DEFAULT_RUN_COUNT: usize = 1_000_000_000;

/// Graphs with at least this many nodes are sampled with
/// [`Sampling::Bernoulli`] by [`Sampling::for_graph_size`].
pub const LARGE_GRAPH_NODES: usize = 100_000;

/// How a procedure picks the nodes it looks at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Sampling {
    /// Keep each node independently with the given probability, in percent.
    ///
    /// Cheap and uniform, for graphs too large to scan exhaustively.
    Bernoulli {
        /// Sampling percentage, in `0..=100`.
        percent: f64,
    },
    /// Scan contiguous windows of node ids.
    ///
    /// Deterministic and exhaustive, for small graphs.
    Block {
        /// Nodes per window.
        size: usize,
    },
}

impl Default for Sampling {
    fn default() -> Self {
        Sampling::Block { size: 1000 }
    }
}

impl Sampling {
    /// Bernoulli sampling on large graphs, block sampling otherwise.
    pub fn for_graph_size(num_nodes: usize) -> Self {
        match num_nodes >= LARGE_GRAPH_NODES {
            true => Sampling::Bernoulli { percent: 10.0 },
            false => Sampling::default(),
        }
    }

    /// Suffix selecting the procedure variant.
    pub fn suffix(&self) -> &'static str {
        match self {
            Sampling::Bernoulli { .. } => "bernoulli",
            Sampling::Block { .. } => "block",
        }
    }

    fn argument(&self) -> Argument {
        match *self {
            Sampling::Bernoulli { percent } => Argument::Float(percent),
            Sampling::Block { size } => Argument::Int(size as i64),
        }
    }
}

/// How many rewrites a procedure should apply before returning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunCount {
    /// Return after this many successful rewrites.
    Limited(usize),
    /// Keep going until stopped.
    #[default]
    UntilTimeout,
}

impl RunCount {
    /// The count passed to the procedure.
    pub fn value(self) -> usize {
        match self {
            RunCount::Limited(n) => n,
            RunCount::UntilTimeout => DEFAULT_RUN_COUNT,
        }
    }
}

impl From<Option<usize>> for RunCount {
    fn from(count: Option<usize>) -> Self {
        count.map_or(RunCount::UntilTimeout, RunCount::Limited)
    }
}

/// A call of a sampled rewrite procedure, before worker-specific arguments
/// are filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureCall {
    /// Procedure name, without the sampling suffix.
    pub procedure: String,
    /// Circuit to rewrite.
    pub label: Label,
    /// Gate codes the procedure should consider. Empty means all.
    pub gate_codes: Vec<GateCode>,
    /// Sampling strategy.
    pub sampling: Sampling,
    /// Rewrites per call.
    pub run_count: RunCount,
}

impl ProcedureCall {
    /// A call of `procedure` on `label` with default settings.
    pub fn new(procedure: impl Into<String>, label: Label) -> Self {
        Self {
            procedure: procedure.into(),
            label,
            gate_codes: Vec::new(),
            sampling: Sampling::default(),
            run_count: RunCount::default(),
        }
    }

    /// Restrict the gate codes considered.
    pub fn with_gate_codes(mut self, codes: impl IntoIterator<Item = GateCode>) -> Self {
        self.gate_codes = codes.into_iter().collect();
        self
    }

    /// Set the sampling strategy.
    pub fn with_sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    /// Set the number of rewrites per call.
    pub fn with_run_count(mut self, run_count: impl Into<RunCount>) -> Self {
        self.run_count = run_count.into();
        self
    }

    /// The full procedure name, including the sampling suffix.
    pub fn name(&self) -> String {
        format!("{}_{}", self.procedure, self.sampling.suffix())
    }

    /// The invocation sent by one worker.
    pub fn invocation(
        &self,
        worker_id: usize,
        worker_count: usize,
        timeout_secs: f64,
    ) -> Invocation {
        let codes = self.gate_codes.iter().map(|c| c.name()).join("|");
        Invocation::new(
            self.name(),
            [
                Argument::Int(self.label),
                Argument::Str(codes),
                self.sampling.argument(),
                Argument::Int(self.run_count.value() as i64),
                Argument::Int(worker_id as i64),
                Argument::Int(worker_count as i64),
                Argument::Float(timeout_secs),
            ],
        )
    }
}

/// Run `replicas` concurrent workers, each invoking `call` once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    /// Number of workers.
    pub replicas: usize,
    /// What each of them runs.
    pub call: ProcedureCall,
}

impl Directive {
    /// Create a new directive.
    pub fn new(replicas: usize, call: ProcedureCall) -> Self {
        Self { replicas, call }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn render() {
        let call = ProcedureCall::new("cancel_inverse_pairs", 2)
            .with_gate_codes([GateCode::H, GateCode::T, GateCode::CX])
            .with_sampling(Sampling::Bernoulli { percent: 10.0 });
        assert_eq!(
            call.invocation(1, 4, 30.0).to_string(),
            "cancel_inverse_pairs_bernoulli(2, 'H|T|CX', 10.0, 1000000000, 1, 4, 30.0)"
        );

        let call = call
            .with_sampling(Sampling::Block { size: 64 })
            .with_run_count(Some(5));
        assert_eq!(
            call.invocation(0, 1, 0.5).to_string(),
            "cancel_inverse_pairs_block(2, 'H|T|CX', 64, 5, 0, 1, 0.5)"
        );
    }

    #[test]
    fn sampling_policy() {
        assert_eq!(Sampling::for_graph_size(10), Sampling::Block { size: 1000 });
        assert_eq!(
            Sampling::for_graph_size(LARGE_GRAPH_NODES),
            Sampling::Bernoulli { percent: 10.0 }
        );
    }
}
