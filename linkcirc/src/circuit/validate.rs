//! Structural invariant checks for linked circuits.

use std::collections::VecDeque;

use derive_more::{Display, Error};
use fxhash::FxHashMap;

use super::LinkedCircuit;
use crate::link::{GateId, Link, Port, MAX_PORTS};
use crate::ops::GateCode;

/// A broken structural invariant.
#[derive(Debug, Display, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum InvariantViolation {
    /// The referenced node is not in the arena.
    #[display("Node {node} does not exist.")]
    MissingNode {
        /// The missing node.
        node: GateId,
    },
    /// A link points at a node that is not in the arena.
    #[display("Node {node} links to {neighbour}, which does not exist.")]
    MissingNeighbour {
        /// The node holding the link.
        node: GateId,
        /// The missing target.
        neighbour: GateId,
    },
    /// `n.next[p] = (m, q)` without `m.prev[q] = (n, p)`, or the reverse.
    #[display("The link {from} -> {to} is not mirrored on the other side.")]
    BrokenBacklink {
        /// The source port.
        from: Link,
        /// The target port.
        to: Link,
    },
    /// A port beyond the gate's arity carries a link.
    #[display("Node {node} ({code:?}) uses port {port} beyond its arity.")]
    ArityMismatch {
        /// The offending node.
        node: GateId,
        /// Its gate code.
        code: GateCode,
        /// The port in use.
        port: Port,
    },
    /// An `In` node with a predecessor or an `Out` node with a successor.
    #[display("Sentinel {node} ({code:?}) is linked on the wrong side.")]
    SentinelShape {
        /// The offending sentinel.
        node: GateId,
        /// `In` or `Out`.
        code: GateCode,
    },
    /// A wire ends without reaching a sentinel.
    #[display("Port {port} of node {node} is not linked to a sentinel-terminated wire.")]
    OpenWire {
        /// The node with a missing link.
        node: GateId,
        /// The unlinked port.
        port: Port,
    },
    /// Some nodes lie on a cycle.
    #[display("{remaining} nodes lie on or behind a cycle.")]
    Cycle {
        /// Number of nodes that could not be ordered.
        remaining: usize,
    },
}

impl LinkedCircuit {
    /// Check bidirectional consistency, arity, sentinel shape and acyclicity.
    ///
    /// Wires are allowed to start or end without sentinels. Use
    /// [`LinkedCircuit::check_closed`] to also require that every wire runs
    /// from an `In` to an `Out` node.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for node in self.nodes() {
            for port in Port::all(MAX_PORTS).skip(node.arity()) {
                if node.prev(port).is_some() || node.next(port).is_some() {
                    return Err(InvariantViolation::ArityMismatch {
                        node: node.id,
                        code: node.code,
                        port,
                    });
                }
            }
            let bad_in = node.code == GateCode::In && node.prev.iter().any(Option::is_some);
            let bad_out = node.code == GateCode::Out && node.next.iter().any(Option::is_some);
            if bad_in || bad_out {
                return Err(InvariantViolation::SentinelShape {
                    node: node.id,
                    code: node.code,
                });
            }
            for (port, to) in node.successors() {
                let from = node.link_to(port);
                let target = self.get(to.id).ok_or(InvariantViolation::MissingNeighbour {
                    node: node.id,
                    neighbour: to.id,
                })?;
                if target.prev(to.port) != Some(from) {
                    return Err(InvariantViolation::BrokenBacklink { from, to });
                }
            }
            for (port, from) in node.predecessors() {
                let to = node.link_to(port);
                let source = self.get(from.id).ok_or(InvariantViolation::MissingNeighbour {
                    node: node.id,
                    neighbour: from.id,
                })?;
                if source.next(from.port) != Some(to) {
                    return Err(InvariantViolation::BrokenBacklink { from, to });
                }
            }
        }
        self.check_acyclic()
    }

    /// Check [`LinkedCircuit::check_invariants`], and that every port of every
    /// operation is linked on both sides so each wire runs from `In` to `Out`.
    pub fn check_closed(&self) -> Result<(), InvariantViolation> {
        self.check_invariants()?;
        for node in self.nodes() {
            for port in node.ports() {
                let missing_prev = node.code != GateCode::In && node.prev(port).is_none();
                let missing_next = node.code != GateCode::Out && node.next(port).is_none();
                if missing_prev || missing_next {
                    return Err(InvariantViolation::OpenWire {
                        node: node.id,
                        port,
                    });
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over the `next` links.
    fn check_acyclic(&self) -> Result<(), InvariantViolation> {
        let mut indegree: FxHashMap<GateId, usize> = self
            .nodes()
            .map(|n| (n.id, n.predecessors().count()))
            .collect();
        let mut queue: VecDeque<GateId> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut ordered = 0;
        while let Some(id) = queue.pop_front() {
            ordered += 1;
            let Some(node) = self.get(id) else { continue };
            for (_, succ) in node.successors() {
                if let Some(d) = indegree.get_mut(&succ.id) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(succ.id);
                    }
                }
            }
        }
        match ordered == self.len() {
            true => Ok(()),
            false => Err(InvariantViolation::Cycle {
                remaining: self.len() - ordered,
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::circuit::GateNode;
    use crate::utils::test::{id, line, port};

    #[test]
    fn valid_line() {
        let circ = line(&[GateCode::H, GateCode::X, GateCode::T]);
        circ.check_closed().unwrap();
    }

    #[test]
    fn broken_backlink() {
        let mut circ = line(&[GateCode::H, GateCode::X]);
        circ.get_mut(id(2)).unwrap().prev[0] = None;
        assert_eq!(
            circ.check_invariants(),
            Err(InvariantViolation::BrokenBacklink {
                from: Link::new(id(1), port(0)),
                to: Link::new(id(2), port(0)),
            })
        );
    }

    #[test]
    fn arity_mismatch() {
        let mut circ = line(&[GateCode::H]);
        circ.get_mut(id(1)).unwrap().next[1] = Some(Link::new(id(2), port(0)));
        assert_eq!(
            circ.check_invariants(),
            Err(InvariantViolation::ArityMismatch {
                node: id(1),
                code: GateCode::H,
                port: port(1),
            })
        );
    }

    #[test]
    fn cycle() {
        let mut circ = LinkedCircuit::new();
        circ.insert(GateNode::new(id(0), GateCode::H, 0));
        circ.insert(GateNode::new(id(1), GateCode::X, 0));
        circ.connect(Link::new(id(0), port(0)), Link::new(id(1), port(0)));
        circ.connect(Link::new(id(1), port(0)), Link::new(id(0), port(0)));
        assert_eq!(
            circ.check_invariants(),
            Err(InvariantViolation::Cycle { remaining: 2 })
        );
    }

    #[test]
    fn open_wire() {
        let mut circ = line(&[GateCode::H]);
        let out = circ.splice_out(id(2)).unwrap();
        assert_eq!(out.code, GateCode::Out);
        circ.check_invariants().unwrap();
        assert_eq!(
            circ.check_closed(),
            Err(InvariantViolation::OpenWire {
                node: id(1),
                port: port(0),
            })
        );
    }
}
