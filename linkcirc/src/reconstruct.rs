//! Recovery of an ordered, qubit-indexed circuit from linked gate nodes.
//!
//! Reconstruction works on any node set, typically all rows sharing a label,
//! and runs in three steps:
//!
//! 1. Moments. A worklist over predecessor counts (Kahn's algorithm) gives
//!    every node `1 + max(moment of its predecessors)`, and moment 0 to nodes
//!    without predecessors.
//! 2. Qubits. Every wire start gets a fresh qubit index, in `(id, port)`
//!    order unless a wire order is supplied. Walking the nodes by moment,
//!    each port then inherits the qubit of the predecessor slot whose `next`
//!    link points back at it.
//! 3. Emission. Nodes are sorted by `(moment, id)` and handed to a
//!    [`GateTranslator`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use derive_more::{Display, Error, From};
use fxhash::FxHashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::circuit::{GateNode, Label, LinkedCircuit};
use crate::link::{GateId, Link, Port, MAX_PORTS};
use crate::ops::GateCode;
use crate::serialize::{GateSpec, GateTranslator, Qubit, UnsupportedOperation};
use crate::store::{GraphStore, StoreError};

/// Options for circuit reconstruction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructOptions {
    /// Emit `In`/`Out` sentinels alongside the operations.
    pub keep_sentinels: bool,
    /// Qubit index of each `In` sentinel. Wires starting elsewhere get fresh
    /// indices not used by the map.
    pub wire_order: Option<BTreeMap<GateId, Qubit>>,
}

/// What a reconstructed node stands for.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOp<Op> {
    /// The start of a wire.
    Input(Qubit),
    /// The end of a wire.
    Output(Qubit),
    /// A native operation.
    Gate(Op),
}

/// A reconstructed node, with its position in the circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedOp<Op> {
    /// The node it came from.
    pub id: GateId,
    /// Its topological layer.
    pub moment: usize,
    /// The operation.
    pub op: NodeOp<Op>,
}

/// A moment-ordered circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction<Op> {
    /// Number of distinct wires.
    pub num_qubits: usize,
    /// Nodes in `(moment, id)` order.
    pub ops: Vec<ReconstructedOp<Op>>,
}

impl<Op> Reconstruction<Op> {
    /// The native operations, in order, without sentinels.
    pub fn into_gates(self) -> Vec<Op> {
        self.ops
            .into_iter()
            .filter_map(|r| match r.op {
                NodeOp::Gate(op) => Some(op),
                _ => None,
            })
            .collect()
    }

    /// Number of distinct moments.
    pub fn depth(&self) -> usize {
        self.ops.iter().map(|r| r.moment).dedup().count()
    }
}

/// Moment and per-port qubit of every node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    /// Topological layer of each node.
    pub moments: FxHashMap<GateId, usize>,
    /// Qubit on each port of each node.
    pub qubits: FxHashMap<GateId, [Option<Qubit>; MAX_PORTS]>,
    /// Number of distinct wires.
    pub num_qubits: usize,
}

impl Layout {
    /// Node ids in `(moment, id)` order.
    pub fn order(&self) -> Vec<GateId> {
        self.moments
            .iter()
            .map(|(&id, &m)| (m, id))
            .sorted_unstable()
            .map(|(_, id)| id)
            .collect()
    }

    /// The operand qubits of a node, in operand order.
    fn operands(&self, node: &GateNode) -> Vec<Qubit> {
        let slots = self.qubits.get(&node.id);
        let mut qubits = node
            .ports()
            .filter_map(|p| slots.and_then(|s| s[p.index()]))
            .collect_vec();
        if node.switch && qubits.len() == 2 {
            qubits.reverse();
        }
        qubits
    }
}

/// Assign a moment to every node.
#[tracing::instrument(target = "linkcirc::metrics", skip_all)]
pub fn moments(circ: &LinkedCircuit) -> Result<FxHashMap<GateId, usize>, ReconstructError> {
    let mut waiting: FxHashMap<GateId, usize> = FxHashMap::default();
    let mut successors: FxHashMap<GateId, Vec<GateId>> = FxHashMap::default();
    for node in circ.nodes() {
        if node.is_dangling() {
            return Err(ReconstructError::DanglingNode { node: node.id });
        }
        for (_, pred) in node.predecessors() {
            if !circ.contains(pred.id) {
                return Err(ReconstructError::GraphInconsistency {
                    node: node.id,
                    missing: pred.id,
                });
            }
            successors.entry(pred.id).or_default().push(node.id);
        }
        waiting.insert(node.id, node.predecessors().count());
    }

    let mut moments = FxHashMap::default();
    let mut queue: VecDeque<GateId> = circ
        .nodes()
        .filter(|n| waiting.get(&n.id) == Some(&0))
        .map(|n| n.id)
        .collect();
    for &id in &queue {
        moments.insert(id, 0);
    }
    while let Some(id) = queue.pop_front() {
        let moment = moments.get(&id).copied().unwrap_or_default();
        for &succ in successors.get(&id).into_iter().flatten() {
            let m = moments.entry(succ).or_insert(0);
            *m = (*m).max(moment + 1);
            if let Some(w) = waiting.get_mut(&succ) {
                *w -= 1;
                if *w == 0 {
                    queue.push_back(succ);
                }
            }
        }
    }

    // Nodes still waiting lie on or behind a cycle.
    if let Some(node) = circ.nodes().find(|n| waiting.get(&n.id) != Some(&0)) {
        let missing = node
            .predecessors()
            .map(|(_, l)| l.id)
            .find(|p| waiting.get(p) != Some(&0))
            .unwrap_or(node.id);
        return Err(ReconstructError::GraphInconsistency {
            node: node.id,
            missing,
        });
    }
    Ok(moments)
}

/// Assign moments and per-port qubits to every node.
pub fn layout(
    circ: &LinkedCircuit,
    wire_order: Option<&BTreeMap<GateId, Qubit>>,
) -> Result<Layout, ReconstructError> {
    let moments = moments(circ)?;
    let mut layout = Layout {
        moments,
        ..Default::default()
    };

    // Fresh indices for every wire start, skipping the ones already taken.
    let taken: BTreeSet<Qubit> = wire_order
        .into_iter()
        .flat_map(|w| w.values())
        .copied()
        .collect();
    let mut fresh = (0..).map(Qubit::new).filter(|q| !taken.contains(q));
    let mut num_qubits = 0;
    for node in circ.nodes() {
        for port in node.ports().filter(|&p| node.prev(p).is_none()) {
            let qubit = match wire_order.and_then(|w| w.get(&node.id)) {
                Some(&q) if port == Port::ZERO => q,
                _ => fresh.next().unwrap_or_default(),
            };
            num_qubits += 1;
            layout.qubits.entry(node.id).or_insert([None; MAX_PORTS])[port.index()] = Some(qubit);
        }
    }
    layout.num_qubits = num_qubits;

    for id in layout.order() {
        let Some(node) = circ.get(id) else { continue };
        for (port, pred_link) in node.predecessors() {
            let to = node.link_to(port);
            let pred = circ.get(pred_link.id).ok_or(ReconstructError::GraphInconsistency {
                node: id,
                missing: pred_link.id,
            })?;
            let slot = pred
                .port_leading_to(to)
                .ok_or(ReconstructError::InvalidLink {
                    from: pred_link,
                    to,
                })?;
            let qubit = layout
                .qubits
                .get(&pred.id)
                .and_then(|q| q[slot.index()])
                .ok_or(ReconstructError::InvalidLink {
                    from: pred_link,
                    to,
                })?;
            layout.qubits.entry(id).or_insert([None; MAX_PORTS])[port.index()] = Some(qubit);
        }
    }
    Ok(layout)
}

/// Rebuild a moment-ordered circuit from a set of nodes.
#[tracing::instrument(target = "linkcirc::metrics", skip_all)]
pub fn reconstruct<T: GateTranslator>(
    circ: &LinkedCircuit,
    translator: &T,
    options: &ReconstructOptions,
) -> Result<Reconstruction<T::Op>, ReconstructError> {
    let layout = layout(circ, options.wire_order.as_ref())?;
    let mut ops = Vec::with_capacity(circ.len());
    for id in layout.order() {
        let Some(node) = circ.get(id) else { continue };
        let moment = layout.moments[&id];
        let qubits = layout.operands(node);
        let op = match node.code {
            GateCode::In | GateCode::Out if !options.keep_sentinels => continue,
            GateCode::In => NodeOp::Input(qubits.first().copied().unwrap_or_default()),
            GateCode::Out => NodeOp::Output(qubits.first().copied().unwrap_or_default()),
            code => {
                let spec = GateSpec {
                    code,
                    qubits,
                    parameter: node.parameter,
                    global_shift: node.global_shift,
                    classically_controlled: node.classically_controlled,
                    measurement_key: node.measurement_key.clone(),
                };
                NodeOp::Gate(translator.decode_op(spec)?)
            }
        };
        ops.push(ReconstructedOp { id, moment, op });
    }
    Ok(Reconstruction {
        num_qubits: layout.num_qubits,
        ops,
    })
}

/// Load a label from the store and reconstruct it.
pub fn reconstruct_label<T: GateTranslator>(
    store: &GraphStore,
    label: Label,
    translator: &T,
    options: &ReconstructOptions,
) -> Result<Reconstruction<T::Op>, ReconstructError> {
    let circ = store.load_label(label)?;
    reconstruct(&circ, translator, options)
}

/// Errors while reconstructing a circuit.
#[derive(Debug, Display, From, Error)]
#[non_exhaustive]
pub enum ReconstructError {
    /// A predecessor is missing or never gets a moment.
    #[display("Node {node} depends on {missing}, which cannot be ordered.")]
    #[from(ignore)]
    GraphInconsistency {
        /// The node that could not be placed.
        node: GateId,
        /// The offending predecessor.
        missing: GateId,
    },
    /// An operation with no links at all.
    #[display("Node {node} is not connected to any wire.")]
    #[from(ignore)]
    DanglingNode {
        /// The orphaned node.
        node: GateId,
    },
    /// A `prev` link with no matching `next` link on the predecessor.
    #[display("The link {from} -> {to} is not mirrored by the predecessor.")]
    #[from(ignore)]
    InvalidLink {
        /// The predecessor port.
        from: Link,
        /// The port whose `prev` link is unmatched.
        to: Link,
    },
    /// The translator rejected a node.
    UnsupportedOperation(UnsupportedOperation),
    /// Loading the nodes failed.
    Store(StoreError),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ingest::{ingest, IngestOptions};
    use crate::serialize::DirectTranslator;
    use crate::utils::test::{id, line, port};
    use cool_asserts::assert_matches;

    fn spec(code: GateCode, qubits: impl IntoIterator<Item = usize>) -> GateSpec {
        GateSpec::new(code, qubits)
    }

    #[test]
    fn line_moments() {
        let circ = line(&[GateCode::H, GateCode::T]);
        let moments = moments(&circ).unwrap();
        assert_eq!(moments[&id(0)], 0);
        assert_eq!(moments[&id(2)], 2);
        assert_eq!(moments[&id(3)], 3);
    }

    #[test]
    fn switched_operands() {
        let ops = [
            spec(GateCode::CX, [1, 0]),
            spec(GateCode::H, [0]),
            spec(GateCode::CZ, [0, 2]),
        ];
        let (circ, summary) =
            ingest(&DirectTranslator, &ops, &IngestOptions::default(), id(0)).unwrap();
        let options = ReconstructOptions {
            wire_order: Some(summary.wire_order()),
            ..Default::default()
        };
        let out = reconstruct(&circ, &DirectTranslator, &options).unwrap();
        assert_eq!(out.num_qubits, 3);
        assert_eq!(out.depth(), 3);
        assert_eq!(out.into_gates(), ops);
    }

    #[test]
    fn keep_sentinels() {
        let circ = line(&[GateCode::X]);
        let options = ReconstructOptions {
            keep_sentinels: true,
            ..Default::default()
        };
        let out = reconstruct(&circ, &DirectTranslator, &options).unwrap();
        let kinds = out.ops.iter().map(|r| &r.op).collect_vec();
        assert_matches!(
            kinds.as_slice(),
            [NodeOp::Input(_), NodeOp::Gate(_), NodeOp::Output(_)]
        );
    }

    #[test]
    fn fresh_indices_follow_ids() {
        let ops = [spec(GateCode::H, [7]), spec(GateCode::X, [3])];
        let (circ, _) = ingest(&DirectTranslator, &ops, &IngestOptions::default(), id(0)).unwrap();
        let gates = reconstruct(&circ, &DirectTranslator, &ReconstructOptions::default())
            .unwrap()
            .into_gates();
        // In sentinels were created in ascending qubit order: 3 -> 0, 7 -> 1.
        assert_eq!(gates, [spec(GateCode::H, [1]), spec(GateCode::X, [0])]);
    }

    #[test]
    fn dangling() {
        let mut circ = line(&[GateCode::H]);
        circ.insert(GateNode::new(id(9), GateCode::T, 0));
        assert_matches!(
            moments(&circ),
            Err(ReconstructError::DanglingNode { node }) => assert_eq!(node, id(9))
        );
    }

    #[test]
    fn missing_predecessor() {
        let mut circ = line(&[GateCode::H, GateCode::T]);
        circ.splice_out(id(1)).unwrap();
        circ.get_mut(id(2)).unwrap().prev[0] = Some(Link::new(id(1), port(0)));
        assert_matches!(
            reconstruct(&circ, &DirectTranslator, &ReconstructOptions::default()),
            Err(ReconstructError::GraphInconsistency { node, missing }) => {
                assert_eq!(node, id(2));
                assert_eq!(missing, id(1));
            }
        );
    }

    #[test]
    fn unmatched_backlink() {
        let mut circ = line(&[GateCode::H, GateCode::T]);
        circ.get_mut(id(1)).unwrap().next[0] = None;
        assert_matches!(
            reconstruct(&circ, &DirectTranslator, &ReconstructOptions::default()),
            Err(ReconstructError::InvalidLink { .. })
        );
    }
}
