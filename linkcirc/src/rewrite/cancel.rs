//! Cancellation of adjacent inverse gate pairs.
//!
//! A pair `a -> b` cancels when every port of `a` leads straight into the
//! same port of `b`, both nodes have the same orientation, and `b` undoes
//! `a`. Both nodes are then spliced out of their wires and deleted.
//!
//! The procedure takes seven positional arguments:
//!
//! | # | argument      | meaning                                            |
//! |---|---------------|----------------------------------------------------|
//! | 0 | label         | circuit to rewrite                                 |
//! | 1 | gate codes    | `'|'`-separated gate names to consider, `''` = all |
//! | 2 | sample        | percentage (Bernoulli) or block size (block)       |
//! | 3 | run count     | stop after this many cancellations                 |
//! | 4 | worker id     | index of the calling worker                        |
//! | 5 | worker count  | number of workers running this procedure           |
//! | 6 | timeout       | seconds before giving up                           |

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::circuit::{GateNode, Label, LinkedCircuit};
use crate::link::GateId;
use crate::ops::GateCode;
use crate::optimiser::log::PROGRESS_TARGET;
use crate::store::{self, GraphStore, StoreError};

use super::{Invocation, Procedure, ProcedureError, ProcedureOutcome};

/// How candidate nodes are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleMode {
    Bernoulli,
    Block,
}

/// The inverse-pair cancellation procedure.
#[derive(Debug, Clone)]
pub struct CancelInversePairs {
    mode: SampleMode,
    name: String,
}

impl CancelInversePairs {
    /// Name shared by all sampling variants.
    pub const BASE_NAME: &'static str = "cancel_inverse_pairs";

    /// The variant sampling each node with a fixed probability.
    pub fn bernoulli() -> Self {
        Self {
            mode: SampleMode::Bernoulli,
            name: format!("{}_bernoulli", Self::BASE_NAME),
        }
    }

    /// The variant scanning contiguous blocks of node ids.
    pub fn block() -> Self {
        Self {
            mode: SampleMode::Block,
            name: format!("{}_block", Self::BASE_NAME),
        }
    }
}

/// Parsed positional arguments.
#[derive(Debug, Clone)]
struct Args {
    label: Label,
    codes: Option<BTreeSet<GateCode>>,
    run_count: usize,
    worker_id: usize,
    worker_count: usize,
    deadline: Option<Instant>,
}

impl Args {
    fn parse(inv: &Invocation) -> Result<Self, ProcedureError> {
        let codes = match inv.str(1)? {
            "" => None,
            names => Some(
                names
                    .split('|')
                    .map(|n| {
                        GateCode::from_str(n.trim()).map_err(|_| ProcedureError::InvalidInvocation {
                            invocation: inv.to_string(),
                            reason: format!("unknown gate code {n}"),
                        })
                    })
                    .collect::<Result<_, _>>()?,
            ),
        };
        let deadline = Duration::try_from_secs_f64(inv.float(6)?)
            .ok()
            .and_then(|d| Instant::now().checked_add(d));
        Ok(Self {
            label: inv.int(0)?,
            codes,
            run_count: inv.count(3)?,
            worker_id: inv.count(4)?,
            worker_count: inv.count(5)?.max(1),
            deadline,
        })
    }

    fn accepts(&self, code: GateCode) -> bool {
        !code.is_sentinel() && self.codes.as_ref().is_none_or(|c| c.contains(&code))
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Produces successive candidate samples.
#[derive(Debug)]
enum Sampler {
    Bernoulli {
        percent: f64,
        exhausted: bool,
    },
    Block {
        size: usize,
        first: GateId,
        cursor: GateId,
        stride: i64,
        found_in_sweep: bool,
    },
}

impl Sampler {
    fn new(
        mode: SampleMode,
        inv: &Invocation,
        args: &Args,
        store: &GraphStore,
    ) -> Result<Self, ProcedureError> {
        Ok(match mode {
            SampleMode::Bernoulli => Sampler::Bernoulli {
                percent: inv.float(2)?,
                exhausted: false,
            },
            SampleMode::Block => {
                let size = inv.count(2)?.max(1);
                let base = store
                    .nodes_from(args.label, GateId::new(i64::MIN), 1)?
                    .first()
                    .map_or(0, |n| n.id.index());
                let first = GateId::new(base + (args.worker_id * size) as i64);
                Sampler::Block {
                    size,
                    first,
                    cursor: first,
                    stride: (args.worker_count * size) as i64,
                    found_in_sweep: false,
                }
            }
        })
    }

    /// The next candidates, or `None` once sampling cannot find anything new.
    fn sample(
        &mut self,
        store: &GraphStore,
        label: Label,
    ) -> Result<Option<Vec<GateNode>>, StoreError> {
        match self {
            Sampler::Bernoulli { percent, exhausted } => {
                if *exhausted || *percent <= 0.0 {
                    return Ok(None);
                }
                Ok(Some(store::read_bernoulli(store.connection(), label, *percent)?))
            }
            Sampler::Block {
                size,
                first,
                cursor,
                stride,
                found_in_sweep,
            } => {
                let mut block = store.nodes_from(label, *cursor, *size)?;
                if block.is_empty() {
                    // End of the sweep.
                    if !std::mem::take(found_in_sweep) || *cursor == *first {
                        return Ok(None);
                    }
                    *cursor = *first;
                    block = store.nodes_from(label, *cursor, *size)?;
                }
                *cursor = GateId::new(cursor.index() + *stride);
                Ok(Some(block))
            }
        }
    }

    /// Record whether the last sample produced a cancellation.
    fn record(&mut self, found: bool) {
        match self {
            Sampler::Bernoulli { percent, exhausted } => {
                // A full sample with no match means nothing is left.
                *exhausted = !found && *percent >= 100.0;
            }
            Sampler::Block { found_in_sweep, .. } => *found_in_sweep |= found,
        }
    }
}

/// Whether `b` directly undoes `a`.
pub fn cancels(a: &GateNode, b: &GateNode) -> bool {
    !a.code.is_sentinel()
        && a.arity() == b.arity()
        && a.switch == b.switch
        && !a.classically_controlled
        && !b.classically_controlled
        && a.ports().all(|p| a.next(p) == Some(b.link_to(p)))
        && a.code.is_inverse_of(a.parameter, b.code, b.parameter)
}

/// Cancel `a` and `b` if they still form a pair.
///
/// Both nodes and their neighbours are read again inside an immediate
/// transaction. Returns `false` without changing anything if the pair was
/// modified since it was sampled.
pub fn try_cancel(store: &mut GraphStore, a: GateId, b: GateId) -> Result<bool, ProcedureError> {
    let tx = store.immediate_transaction()?;
    let (Some(node_a), Some(node_b)) = (store::read_node(&tx, a)?, store::read_node(&tx, b)?)
    else {
        return Ok(false);
    };
    if !cancels(&node_a, &node_b) {
        return Ok(false);
    }
    let neighbours: BTreeSet<GateId> = node_a
        .predecessors()
        .chain(node_b.successors())
        .map(|(_, link)| link.id)
        .filter(|&id| id != a && id != b)
        .collect();
    let mut local: LinkedCircuit = [node_a, node_b].into_iter().collect();
    for id in neighbours {
        let node = store::read_node(&tx, id)?.ok_or(
            crate::circuit::InvariantViolation::MissingNeighbour {
                node: a,
                neighbour: id,
            },
        )?;
        local.insert(node);
    }
    local.splice_out(a)?;
    local.splice_out(b)?;
    for node in local.nodes() {
        store::write_links(&tx, node)?;
    }
    store::delete_node(&tx, a)?;
    store::delete_node(&tx, b)?;
    tx.commit().map_err(StoreError::from)?;
    Ok(true)
}

impl Procedure for CancelInversePairs {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(
        &self,
        store: &mut GraphStore,
        invocation: &Invocation,
    ) -> Result<ProcedureOutcome, ProcedureError> {
        let args = Args::parse(invocation)?;
        let mut sampler = Sampler::new(self.mode, invocation, &args, store)?;
        let mut outcome = ProcedureOutcome::default();

        'sampling: while outcome.applied < args.run_count {
            if store.stop_requested()? {
                outcome.stopped = true;
                break;
            }
            if args.expired() {
                break;
            }
            let Some(candidates) = sampler.sample(store, args.label)? else {
                break;
            };
            let mut found = false;
            for candidate in candidates {
                if !args.accepts(candidate.code) {
                    continue;
                }
                // Earlier cancellations in this sample may have moved it.
                let Some(a) = store.node(candidate.id)? else {
                    continue;
                };
                let Some(next) = a.next.first().copied().flatten() else {
                    continue;
                };
                let Some(b) = store.node(next.id)? else {
                    continue;
                };
                if !cancels(&a, &b) {
                    continue;
                }

                if store.stop_requested()? {
                    outcome.stopped = true;
                    break 'sampling;
                }
                if args.expired() || outcome.applied >= args.run_count {
                    break 'sampling;
                }
                outcome.iterations += 1;
                match try_cancel(store, a.id, b.id)? {
                    true => {
                        outcome.applied += 1;
                        found = true;
                    }
                    false => outcome.conflicts += 1,
                }
            }
            sampler.record(found);
        }

        tracing::debug!(
            target: PROGRESS_TARGET,
            procedure = %self.name,
            worker = args.worker_id,
            applied = outcome.applied,
            conflicts = outcome.conflicts,
            stopped = outcome.stopped,
            "procedure finished"
        );
        Ok(outcome)
    }
}
