//! Resource-bounded clustering of gate nodes into widgets.
//!
//! A [`Widgetizer`] is a union-find over node ids where every root carries
//! the summed [`WidgetCost`] of its members. Merging two clusters is refused
//! when the result would exceed the T-count or depth ceiling, so every
//! widget stays within both bounds.
//!
//! Edges are processed in the order given. The partition depends on that
//! order, but the same order and ceilings always give the same result.

use std::collections::BTreeMap;

use fxhash::FxHashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::circuit::{Label, WidgetCost};
use crate::link::GateId;
use crate::optimiser::log::{LOG_TARGET, PROGRESS_TARGET};
use crate::store::{GraphStore, StoreError};

/// Ceilings and batching for widgetization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetizeOptions {
    /// Maximum T-count of a widget.
    pub max_t: usize,
    /// Maximum depth of a widget.
    pub max_d: usize,
    /// Number of edges (and nodes) read from the store at a time.
    pub chunk_size: usize,
}

impl Default for WidgetizeOptions {
    fn default() -> Self {
        Self {
            max_t: 10,
            max_d: 100,
            chunk_size: 10_000,
        }
    }
}

/// Outcome of [`Widgetizer::union`]. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnionResult {
    /// The two clusters were merged.
    Merged,
    /// Both nodes were already in the same cluster.
    AlreadyMerged,
    /// The merged cluster would exceed the T-count ceiling.
    TCountExceeded,
    /// The merged cluster would exceed the depth ceiling.
    DepthExceeded,
}

/// A cluster of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Widget {
    /// Summed depth of the members.
    pub depth: usize,
    /// Summed T-count of the members.
    pub t_count: usize,
    /// The representative node.
    pub root_id: GateId,
    /// Every node in the cluster, in id order.
    pub members: Vec<GateId>,
}

/// Tally of union outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnionStats {
    /// Successful merges.
    pub merged: usize,
    /// Edges inside a cluster.
    pub already_merged: usize,
    /// Merges refused on T-count.
    pub t_count_exceeded: usize,
    /// Merges refused on depth.
    pub depth_exceeded: usize,
}

/// Union-find over node ids with per-cluster resource costs.
///
/// The id-to-root map persists across calls, so edges can be fed in any
/// number of sequential batches.
#[derive(Debug, Clone)]
pub struct Widgetizer {
    max_t: usize,
    max_d: usize,
    parent: FxHashMap<GateId, GateId>,
    /// Cost of each root's cluster.
    costs: FxHashMap<GateId, WidgetCost>,
    stats: UnionStats,
}

impl Widgetizer {
    /// Create an empty widgetizer with the given ceilings.
    pub fn new(max_t: usize, max_d: usize) -> Self {
        Self {
            max_t,
            max_d,
            parent: FxHashMap::default(),
            costs: FxHashMap::default(),
            stats: UnionStats::default(),
        }
    }

    /// Create an empty widgetizer with the ceilings from `options`.
    pub fn with_options(options: &WidgetizeOptions) -> Self {
        Self::new(options.max_t, options.max_d)
    }

    /// Add a singleton cluster, unless the node is already known.
    pub fn add_node(&mut self, id: GateId, cost: WidgetCost) {
        if self.parent.contains_key(&id) {
            return;
        }
        self.parent.insert(id, id);
        self.costs.insert(id, cost);
    }

    /// Whether the node has been added.
    pub fn contains(&self, id: GateId) -> bool {
        self.parent.contains_key(&id)
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    /// Whether no node has been added.
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// The root of a node's cluster, compressing the path to it.
    ///
    /// Unknown nodes are their own root.
    pub fn find(&mut self, id: GateId) -> GateId {
        let mut root = id;
        while let Some(&p) = self.parent.get(&root) {
            if p == root {
                break;
            }
            root = p;
        }
        let mut node = id;
        while node != root {
            let Some(next) = self.parent.insert(node, root) else {
                break;
            };
            node = next;
        }
        root
    }

    /// The cost of a node's cluster.
    pub fn cost(&mut self, id: GateId) -> WidgetCost {
        let root = self.find(id);
        self.costs.get(&root).copied().unwrap_or_default()
    }

    /// Merge the clusters of `a` and `b` if both ceilings allow it.
    ///
    /// The root with the smaller depth is attached under the other one, and
    /// `b`'s root under `a`'s on a tie. Unknown nodes are added with zero
    /// cost first.
    pub fn union(&mut self, a: GateId, b: GateId) -> UnionResult {
        self.add_node(a, WidgetCost::default());
        self.add_node(b, WidgetCost::default());
        let (ra, rb) = (self.find(a), self.find(b));
        let result = if ra == rb {
            UnionResult::AlreadyMerged
        } else {
            let ca = self.costs.get(&ra).copied().unwrap_or_default();
            let cb = self.costs.get(&rb).copied().unwrap_or_default();
            let total = ca + cb;
            if total.t_count > self.max_t {
                UnionResult::TCountExceeded
            } else if total.depth > self.max_d {
                UnionResult::DepthExceeded
            } else {
                let (root, child) = match cb.depth > ca.depth {
                    true => (rb, ra),
                    false => (ra, rb),
                };
                self.parent.insert(child, root);
                self.costs.remove(&child);
                self.costs.insert(root, total);
                UnionResult::Merged
            }
        };
        match result {
            UnionResult::Merged => self.stats.merged += 1,
            UnionResult::AlreadyMerged => self.stats.already_merged += 1,
            UnionResult::TCountExceeded => self.stats.t_count_exceeded += 1,
            UnionResult::DepthExceeded => self.stats.depth_exceeded += 1,
        }
        result
    }

    /// Tally of the unions attempted so far.
    pub fn stats(&self) -> UnionStats {
        self.stats
    }

    /// The root of every known node.
    pub fn assignment(&mut self) -> BTreeMap<GateId, GateId> {
        let ids = self.parent.keys().copied().collect_vec();
        ids.into_iter().map(|id| (id, self.find(id))).collect()
    }

    /// Group every known node by cluster, in root id order.
    pub fn widgets(&mut self) -> Vec<Widget> {
        let mut members: BTreeMap<GateId, Vec<GateId>> = BTreeMap::new();
        for (id, root) in self.assignment() {
            members.entry(root).or_default().push(id);
        }
        members
            .into_iter()
            .map(|(root_id, members)| {
                let cost = self.costs.get(&root_id).copied().unwrap_or_default();
                Widget {
                    depth: cost.depth,
                    t_count: cost.t_count,
                    root_id,
                    members,
                }
            })
            .collect()
    }
}

/// Partition the operations of a label into widgets.
///
/// The edge list is rebuilt first. Nodes and edges are then read in chunks of
/// `options.chunk_size`, while the union-find state is kept across chunks.
/// Sentinels are not part of any widget.
#[tracing::instrument(target = "linkcirc::metrics", skip(store))]
pub fn widgetize_label(
    store: &mut GraphStore,
    label: Label,
    options: &WidgetizeOptions,
) -> Result<Vec<Widget>, StoreError> {
    let chunk = options.chunk_size.max(1);
    let mut widgetizer = Widgetizer::with_options(options);

    let mut start = GateId::new(i64::MIN);
    loop {
        let nodes = store.nodes_from(label, start, chunk)?;
        let Some(last) = nodes.last() else { break };
        start = GateId::new(last.id.index() + 1);
        for node in nodes.iter().filter(|n| !n.code.is_sentinel()) {
            widgetizer.add_node(node.id, node.cost());
        }
        if nodes.len() < chunk {
            break;
        }
    }

    let num_edges = store.rebuild_edge_list(label)?;
    let mut after = 0;
    let mut batch = 0;
    loop {
        let edges = store.read_edges(label, after, chunk)?;
        let Some(last) = edges.last() else { break };
        after = last.seq;
        batch += 1;
        for edge in &edges {
            widgetizer.union(edge.source, edge.target);
        }
        tracing::trace!(
            target: PROGRESS_TARGET,
            batch,
            edges = edges.len(),
            nodes = widgetizer.len(),
            "widgetized edge batch"
        );
        if edges.len() < chunk {
            break;
        }
    }

    let widgets = widgetizer.widgets();
    let stats = widgetizer.stats();
    tracing::info!(
        target: LOG_TARGET,
        label,
        nodes = widgetizer.len(),
        edges = num_edges,
        widgets = widgets.len(),
        merged = stats.merged,
        t_count_exceeded = stats.t_count_exceeded,
        depth_exceeded = stats.depth_exceeded,
        "widgetization done"
    );
    Ok(widgets)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ingest::{ingest_into_store, IngestOptions};
    use crate::ops::GateCode;
    use crate::serialize::{DirectTranslator, GateSpec};
    use crate::utils::test::id;
    use rstest::rstest;

    fn cost(code: GateCode) -> WidgetCost {
        WidgetCost {
            depth: 1,
            t_count: code.t_count(0.0),
        }
    }

    /// `T -> H -> T` on one wire.
    fn t_h_t(max_t: usize, max_d: usize) -> Widgetizer {
        let mut w = Widgetizer::new(max_t, max_d);
        for (i, code) in [GateCode::T, GateCode::H, GateCode::T].into_iter().enumerate() {
            w.add_node(id(i as i64), cost(code));
        }
        w
    }

    #[test]
    fn t_count_ceiling() {
        let mut w = t_h_t(1, 2);
        assert_eq!(w.union(id(0), id(1)), UnionResult::Merged);
        assert_eq!(w.cost(id(1)), WidgetCost { depth: 2, t_count: 1 });
        assert_eq!(w.union(id(1), id(2)), UnionResult::TCountExceeded);
        assert_ne!(w.find(id(2)), w.find(id(0)));
        assert_eq!(w.cost(id(2)), WidgetCost { depth: 1, t_count: 1 });
    }

    #[test]
    fn depth_ceiling() {
        let mut w = t_h_t(5, 2);
        assert_eq!(w.union(id(0), id(1)), UnionResult::Merged);
        assert_eq!(w.union(id(1), id(2)), UnionResult::DepthExceeded);
    }

    #[test]
    fn t_count_checked_first() {
        let mut w = t_h_t(1, 1);
        assert_eq!(w.union(id(0), id(2)), UnionResult::TCountExceeded);
    }

    #[test]
    fn already_merged() {
        let mut w = t_h_t(3, 3);
        assert_eq!(w.union(id(0), id(1)), UnionResult::Merged);
        let before = w.cost(id(0));
        assert_eq!(w.union(id(1), id(0)), UnionResult::AlreadyMerged);
        assert_eq!(w.union(id(2), id(2)), UnionResult::AlreadyMerged);
        assert_eq!(w.cost(id(0)), before);
        assert_eq!(w.stats().already_merged, 2);
    }

    #[test]
    fn weighted_union() {
        let mut w = Widgetizer::new(10, 10);
        for i in 0..4 {
            w.add_node(id(i), cost(GateCode::H));
        }
        w.union(id(1), id(2));
        // The deeper cluster keeps its root.
        w.union(id(0), id(1));
        assert_eq!(w.find(id(0)), id(1));

        // Ties keep the first argument's root.
        let mut other = Widgetizer::new(10, 10);
        other.add_node(id(5), cost(GateCode::H));
        other.add_node(id(6), cost(GateCode::H));
        other.union(id(6), id(5));
        assert_eq!(other.find(id(5)), id(6));
    }

    #[test]
    fn widgets_list_members() {
        let mut w = t_h_t(1, 2);
        w.union(id(0), id(1));
        w.union(id(1), id(2));
        let widgets = w.widgets();
        assert_eq!(widgets.len(), 2);
        assert_eq!(widgets[0].root_id, id(0));
        assert_eq!(widgets[0].members, [id(0), id(1)]);
        assert_eq!(widgets[1].members, [id(2)]);
        assert_eq!((widgets[1].depth, widgets[1].t_count), (1, 1));
    }

    #[rstest]
    #[case(1, 3, 7)]
    #[case(2, 5, 3)]
    #[case(4, 100, 2)]
    fn store_widgets_respect_ceilings(
        #[case] max_t: usize,
        #[case] max_d: usize,
        #[case] chunk_size: usize,
    ) {
        let mut store = GraphStore::open_in_memory().unwrap();
        let ops = (0..30)
            .map(|i| match i % 3 {
                0 => GateSpec::new(GateCode::T, [i % 4]),
                1 => GateSpec::new(GateCode::CX, [i % 4, (i + 1) % 4]),
                _ => GateSpec::new(GateCode::H, [(i + 2) % 4]),
            })
            .collect_vec();
        ingest_into_store(&mut store, &DirectTranslator, &ops, &IngestOptions::default())
            .unwrap();
        let options = WidgetizeOptions {
            max_t,
            max_d,
            chunk_size,
        };
        let widgets = widgetize_label(&mut store, 0, &options).unwrap();
        for widget in &widgets {
            assert!(widget.t_count <= max_t);
            assert!(widget.depth <= max_d);
        }
        let total: usize = widgets.iter().map(|w| w.members.len()).sum();
        assert_eq!(total, 30);

        // Same edges, same ceilings: same partition.
        let again = widgetize_label(&mut store, 0, &options).unwrap();
        assert_eq!(widgets, again);
    }
}
