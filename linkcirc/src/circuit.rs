//! Linked circuit representation.
//!
//! A circuit is stored as a graph of [`GateNode`]s, one per operation plus
//! `In`/`Out` sentinels at the ends of every wire. Each node has up to three
//! ports; port `p` holds a `prev` and a `next` [`Link`] to the neighbouring
//! nodes on the wire passing through that port.
//!
//! [`LinkedCircuit`] is an arena over those nodes, keyed by [`GateId`]. It is
//! the in-memory counterpart of a label's rows in the
//! [`GraphStore`][crate::store::GraphStore], and invariant checking over it
//! is a pure function (see [`LinkedCircuit::check_invariants`]).

pub mod cost;
mod validate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use cost::WidgetCost;
pub use validate::InvariantViolation;

use crate::link::{GateId, Link, Port, MAX_PORTS};
use crate::ops::GateCode;

/// Opaque identifier selecting one circuit out of a shared table.
pub type Label = i64;

/// One operation (or sentinel) of a linked circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateNode {
    /// Unique node id.
    pub id: GateId,
    /// The operation kind.
    pub code: GateCode,
    /// Rotation angle or exponent, in half-turns.
    pub parameter: f64,
    /// Global phase shift of the operation.
    pub global_shift: f64,
    /// For two-qubit gates, whether the first operand sits on port 1.
    pub switch: bool,
    /// Incoming link per port.
    pub prev: [Option<Link>; MAX_PORTS],
    /// Outgoing link per port.
    pub next: [Option<Link>; MAX_PORTS],
    /// Scratch flag owned by rewrite procedures.
    pub visited: bool,
    /// The circuit this node belongs to.
    pub label: Label,
    /// Whether the operation is conditioned on a classical bit.
    pub classically_controlled: bool,
    /// Measurement key, for measurements.
    pub measurement_key: Option<String>,
}

impl GateNode {
    /// Create an unlinked node.
    pub fn new(id: GateId, code: GateCode, label: Label) -> Self {
        Self {
            id,
            code,
            parameter: 0.0,
            global_shift: 0.0,
            switch: false,
            prev: [None; MAX_PORTS],
            next: [None; MAX_PORTS],
            visited: false,
            label,
            classically_controlled: false,
            measurement_key: None,
        }
    }

    /// Set the rotation parameter.
    pub fn with_parameter(mut self, parameter: f64) -> Self {
        self.parameter = parameter;
        self
    }

    /// The number of ports in use, as implied by the gate code.
    #[inline]
    pub fn arity(&self) -> usize {
        self.code.arity()
    }

    /// The ports in use.
    pub fn ports(&self) -> impl Iterator<Item = Port> {
        Port::all(self.arity())
    }

    /// The link arriving at `port`.
    #[inline]
    pub fn prev(&self, port: Port) -> Option<Link> {
        self.prev[port.index()]
    }

    /// The link leaving from `port`.
    #[inline]
    pub fn next(&self, port: Port) -> Option<Link> {
        self.next[port.index()]
    }

    /// The link pointing at `port` of this node.
    #[inline]
    pub fn link_to(&self, port: Port) -> Link {
        Link::new(self.id, port)
    }

    /// Non-null incoming links, with the local port they arrive at.
    pub fn predecessors(&self) -> impl Iterator<Item = (Port, Link)> + '_ {
        self.ports()
            .filter_map(|port| self.prev(port).map(|link| (port, link)))
    }

    /// Non-null outgoing links, with the local port they leave from.
    pub fn successors(&self) -> impl Iterator<Item = (Port, Link)> + '_ {
        self.ports()
            .filter_map(|port| self.next(port).map(|link| (port, link)))
    }

    /// The local port whose `next` link equals `target`, if any.
    ///
    /// This is how a successor finds which of this node's wires it continues.
    pub fn port_leading_to(&self, target: Link) -> Option<Port> {
        self.ports().find(|&port| self.next(port) == Some(target))
    }

    /// Whether every declared port already has its outgoing link.
    pub fn is_resolved(&self) -> bool {
        self.ports().all(|port| self.next(port).is_some())
    }

    /// A non-sentinel node with neither incoming nor outgoing links.
    pub fn is_dangling(&self) -> bool {
        !self.code.is_sentinel()
            && self.prev.iter().all(Option::is_none)
            && self.next.iter().all(Option::is_none)
    }

    /// The resource cost of this node, used when clustering.
    pub fn cost(&self) -> WidgetCost {
        match self.code.is_sentinel() {
            true => WidgetCost::default(),
            false => WidgetCost {
                depth: 1,
                t_count: self.code.t_count(self.parameter),
            },
        }
    }
}

/// An arena of gate nodes keyed by id.
///
/// Iteration is in ascending id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkedCircuit {
    nodes: BTreeMap<GateId, GateNode>,
}

impl LinkedCircuit {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes, sentinels included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of non-sentinel nodes.
    pub fn num_operations(&self) -> usize {
        self.nodes.values().filter(|n| !n.code.is_sentinel()).count()
    }

    /// Insert a node, replacing any node with the same id.
    pub fn insert(&mut self, node: GateNode) -> Option<GateNode> {
        self.nodes.insert(node.id, node)
    }

    /// Get a node.
    pub fn get(&self, id: GateId) -> Option<&GateNode> {
        self.nodes.get(&id)
    }

    /// Get a node mutably.
    pub fn get_mut(&mut self, id: GateId) -> Option<&mut GateNode> {
        self.nodes.get_mut(&id)
    }

    /// Whether a node with this id is present.
    pub fn contains(&self, id: GateId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Iterate over all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &GateNode> + '_ {
        self.nodes.values()
    }

    /// Consume the arena into its nodes, in id order.
    pub fn into_nodes(self) -> impl Iterator<Item = GateNode> {
        self.nodes.into_values()
    }

    /// Connect `from` (an outgoing port) to `to` (an incoming port), setting
    /// both sides of the link.
    ///
    /// Missing endpoints are left untouched.
    pub fn connect(&mut self, from: Link, to: Link) {
        if let Some(src) = self.nodes.get_mut(&from.id) {
            src.next[from.port.index()] = Some(to);
        }
        if let Some(tgt) = self.nodes.get_mut(&to.id) {
            tgt.prev[to.port.index()] = Some(from);
        }
    }

    /// Logically delete a node by short-circuiting its wires.
    ///
    /// For every port, the predecessor's `next` is pointed at the successor
    /// and the successor's `prev` at the predecessor, so the wire skips the
    /// node. The node is then removed from the arena and returned.
    pub fn splice_out(&mut self, id: GateId) -> Result<GateNode, InvariantViolation> {
        let node = self
            .nodes
            .remove(&id)
            .ok_or(InvariantViolation::MissingNode { node: id })?;
        for port in node.ports() {
            let pred = node.prev(port);
            let succ = node.next(port);
            if let Some(pred) = pred {
                let p = self
                    .nodes
                    .get_mut(&pred.id)
                    .ok_or(InvariantViolation::MissingNeighbour {
                        node: id,
                        neighbour: pred.id,
                    })?;
                p.next[pred.port.index()] = succ;
            }
            if let Some(succ) = succ {
                let s = self
                    .nodes
                    .get_mut(&succ.id)
                    .ok_or(InvariantViolation::MissingNeighbour {
                        node: id,
                        neighbour: succ.id,
                    })?;
                s.prev[succ.port.index()] = pred;
            }
        }
        Ok(node)
    }
}

impl FromIterator<GateNode> for LinkedCircuit {
    fn from_iter<I: IntoIterator<Item = GateNode>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().map(|n| (n.id, n)).collect(),
        }
    }
}

impl Extend<GateNode> for LinkedCircuit {
    fn extend<I: IntoIterator<Item = GateNode>>(&mut self, iter: I) {
        self.nodes.extend(iter.into_iter().map(|n| (n.id, n)));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::test::{id, line};

    #[test]
    fn splice_keeps_wire_connected() {
        // In -> H -> T -> Out on one wire.
        let mut circ = line(&[GateCode::H, GateCode::T]);
        circ.check_invariants().unwrap();

        let removed = circ.splice_out(id(1)).unwrap();
        assert_eq!(removed.code, GateCode::H);
        circ.check_invariants().unwrap();

        let input = circ.get(id(0)).unwrap();
        let p0 = Port::new(0).unwrap();
        assert_eq!(input.next(p0), Some(Link::new(id(2), p0)));
        assert_eq!(circ.num_operations(), 1);
    }

    #[test]
    fn splice_missing_node() {
        let mut circ = line(&[GateCode::H]);
        assert_eq!(
            circ.splice_out(id(42)),
            Err(InvariantViolation::MissingNode { node: id(42) })
        );
    }

    #[test]
    fn node_helpers() {
        let circ = line(&[GateCode::T]);
        let t = circ.get(id(1)).unwrap();
        assert!(t.is_resolved());
        assert!(!t.is_dangling());
        assert_eq!(t.cost(), WidgetCost { depth: 1, t_count: 1 });
        let p0 = Port::new(0).unwrap();
        let input = circ.get(id(0)).unwrap();
        assert_eq!(input.port_leading_to(t.link_to(p0)), Some(p0));
        assert_eq!(input.cost(), WidgetCost::default());

        let lonely = GateNode::new(id(9), GateCode::X, 0);
        assert!(lonely.is_dangling());
        assert!(!lonely.is_resolved());
    }
}
