//! Translation of native circuits into linked gate nodes.
//!
//! Operations are turned into [`GateNode`]s one at a time. For each operand
//! the node's `prev` link is taken from the open-wire map (the last port
//! written on that qubit) and the predecessor's `next` link is back-patched
//! to point at the new node, so every node handed out already satisfies
//! bidirectional consistency.
//!
//! Two modes share this logic:
//!
//! - [`ingest`] holds the whole circuit in memory, creating `In` sentinels
//!   for every qubit before the first operation.
//! - [`WindowedIngestor`] accepts operations in windows and, after each one,
//!   releases every node whose outgoing links are all known. Memory is
//!   bounded by the number of open wires rather than by the circuit size.
//!   `In` sentinels are created when a qubit is first seen.
//!
//! With margins enabled, every still-open wire is closed with an `Out`
//! sentinel at the end of the input.
//!
//! The last port written on each qubit is reported in
//! [`IngestSummary::open_wires`]. Passing that map to [`ingest_resumed`] or
//! [`WindowedIngestor::resume`] continues the same wires in a later run.
//!
//! Two-qubit gates are laid out with their operands in ascending qubit
//! order on ports 0 and 1. When the operands were given the other way
//! round, the node's `switch` flag is set.

use std::collections::BTreeMap;

use derive_more::{Display, Error, From};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::circuit::{GateNode, Label, LinkedCircuit};
use crate::link::{GateId, Link, Port};
use crate::ops::GateCode;
use crate::optimiser::log::{LOG_TARGET, PROGRESS_TARGET};
use crate::serialize::{GateSpec, GateTranslator, Qubit, UnsupportedOperation};
use crate::store::{insert_rows, raise_watermark, read_next_id, GraphStore, StoreError};

/// Default number of operations per window.
pub const DEFAULT_WINDOW_SIZE: usize = 1000;

/// Options for circuit ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Label given to every node.
    pub label: Label,
    /// Whether to mark wire ends with `In`/`Out` sentinels.
    pub margins: bool,
    /// Operations per window in windowed mode. Must be larger than 1.
    pub window_size: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            label: 0,
            margins: true,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl IngestOptions {
    fn validate(&self) -> Result<(), IngestError> {
        if self.window_size <= 1 {
            return Err(IngestError::InvalidConfiguration {
                reason: format!("window size must exceed 1, got {}", self.window_size),
            });
        }
        Ok(())
    }
}

/// Wire bookkeeping produced by an ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    /// The `In` sentinel of each qubit.
    pub inputs: BTreeMap<Qubit, GateId>,
    /// The `Out` sentinel of each qubit.
    pub outputs: BTreeMap<Qubit, GateId>,
    /// Number of operation nodes created, sentinels excluded.
    pub operations: usize,
    /// First id not used by this run.
    pub next_id: GateId,
    /// Largest number of nodes held in memory at once.
    pub peak_pending: usize,
    /// Last port written on each qubit, before any `Out` sentinel was added.
    pub open_wires: BTreeMap<Qubit, Link>,
    /// Links `(from, to)` leaving nodes of an earlier run, given through a
    /// resumed open-wire map, into nodes of this one.
    ///
    /// Those earlier nodes were not available here, so their `next` link on
    /// `from.port` still has to be set to `to`.
    pub boundary: Vec<(Link, Link)>,
}

impl IngestSummary {
    /// Map from `In` sentinel to qubit, for reconstructing with the original
    /// qubit indices.
    pub fn wire_order(&self) -> BTreeMap<GateId, Qubit> {
        self.inputs.iter().map(|(&q, &id)| (id, q)).collect()
    }

    /// Set the [`IngestSummary::boundary`] links on the earlier nodes held in
    /// `circ`.
    pub fn stitch(&self, circ: &mut LinkedCircuit) {
        for &(from, to) in &self.boundary {
            circ.connect(from, to);
        }
    }
}

/// The per-operation encoder shared by both modes.
#[derive(Debug, Clone)]
struct Encoder {
    label: Label,
    margins: bool,
    next_id: i64,
    /// Last port written on each qubit.
    open_wires: BTreeMap<Qubit, Link>,
    /// Nodes with at least one outgoing link still unknown.
    pending: BTreeMap<GateId, GateNode>,
    summary: IngestSummary,
}

impl Encoder {
    fn new(options: &IngestOptions, start: GateId, open_wires: BTreeMap<Qubit, Link>) -> Self {
        Self {
            label: options.label,
            margins: options.margins,
            next_id: start.index(),
            open_wires,
            pending: BTreeMap::new(),
            summary: IngestSummary::default(),
        }
    }

    fn fresh_id(&mut self) -> GateId {
        let id = GateId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Create the `In` sentinel of a qubit seen for the first time.
    fn open_wire(&mut self, qubit: Qubit) {
        if !self.margins || self.open_wires.contains_key(&qubit) {
            return;
        }
        let id = self.fresh_id();
        self.pending
            .insert(id, GateNode::new(id, GateCode::In, self.label));
        self.open_wires.insert(qubit, Link::new(id, Port::ZERO));
        self.summary.inputs.insert(qubit, id);
    }

    /// Link `node` on `port` to the last port written on `qubit`.
    fn attach(&mut self, node: &mut GateNode, port: Port, qubit: Qubit) {
        let to = node.link_to(port);
        if let Some(from) = self.open_wires.insert(qubit, to) {
            node.prev[port.index()] = Some(from);
            self.back_patch(from, to);
        }
    }

    /// Point the predecessor's `next` at `to`.
    ///
    /// Nodes are only evicted once resolved, so a predecessor missing from
    /// `pending` belongs to an earlier run.
    fn back_patch(&mut self, from: Link, to: Link) {
        match self.pending.get_mut(&from.id) {
            Some(pred) => pred.next[from.port.index()] = Some(to),
            None => self.summary.boundary.push((from, to)),
        }
    }

    fn push(&mut self, spec: GateSpec) -> Result<(), UnsupportedOperation> {
        spec.validate()?;
        for &q in &spec.qubits {
            self.open_wire(q);
        }
        let (operands, switch) = port_layout(&spec);
        let id = self.fresh_id();
        let mut node = GateNode::new(id, spec.code, self.label);
        node.parameter = spec.parameter;
        node.global_shift = spec.global_shift;
        node.switch = switch;
        node.classically_controlled = spec.classically_controlled;
        node.measurement_key = spec.measurement_key;
        for (port, qubit) in Port::all(operands.len()).zip(operands) {
            self.attach(&mut node, port, qubit);
        }
        self.pending.insert(id, node);
        self.summary.operations += 1;
        self.summary.peak_pending = self.summary.peak_pending.max(self.pending.len());
        Ok(())
    }

    /// Remove and return every node whose outgoing links are all known.
    fn evict_resolved(&mut self) -> Vec<GateNode> {
        let resolved = self
            .pending
            .values()
            .filter(|n| n.is_resolved())
            .map(|n| n.id)
            .collect_vec();
        resolved
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    /// Close every open wire and return all remaining nodes.
    fn finish(mut self) -> (Vec<GateNode>, IngestSummary) {
        let open = std::mem::take(&mut self.open_wires);
        if self.margins {
            for (&qubit, &from) in &open {
                let id = self.fresh_id();
                let mut out = GateNode::new(id, GateCode::Out, self.label);
                out.prev[0] = Some(from);
                self.back_patch(from, out.link_to(Port::ZERO));
                self.pending.insert(id, out);
                self.summary.outputs.insert(qubit, id);
            }
        }
        self.summary.open_wires = open;
        self.summary.next_id = GateId::new(self.next_id);
        let nodes = self.pending.into_values().collect();
        (nodes, self.summary)
    }
}

/// The qubit on each port, and whether two-qubit operands were reversed.
fn port_layout(spec: &GateSpec) -> (Vec<Qubit>, bool) {
    match spec.qubits.as_slice() {
        &[a, b] if b < a => (vec![b, a], true),
        qubits => (qubits.to_vec(), false),
    }
}

/// Ingest a whole circuit in memory.
///
/// Node ids are assigned consecutively from `start`. With margins enabled,
/// the `In` sentinels come first, in ascending qubit order.
pub fn ingest<'a, T: GateTranslator>(
    translator: &T,
    ops: impl IntoIterator<Item = &'a T::Op>,
    options: &IngestOptions,
    start: GateId,
) -> Result<(LinkedCircuit, IngestSummary), IngestError>
where
    T::Op: 'a,
{
    ingest_resumed(translator, ops, options, start, BTreeMap::new())
}

/// Ingest a circuit in memory, continuing the wires of an earlier run.
///
/// `open_wires` is the [`IngestSummary::open_wires`] of that run. Qubits it
/// lists get no `In` sentinel, and the links back into the earlier nodes are
/// returned in [`IngestSummary::boundary`].
#[tracing::instrument(target = "linkcirc::metrics", skip_all)]
pub fn ingest_resumed<'a, T: GateTranslator>(
    translator: &T,
    ops: impl IntoIterator<Item = &'a T::Op>,
    options: &IngestOptions,
    start: GateId,
    open_wires: BTreeMap<Qubit, Link>,
) -> Result<(LinkedCircuit, IngestSummary), IngestError>
where
    T::Op: 'a,
{
    let specs: Vec<GateSpec> = ops
        .into_iter()
        .map(|op| translator.encode_op(op))
        .collect::<Result<_, _>>()?;
    let mut encoder = Encoder::new(options, start, open_wires);
    for qubit in specs.iter().flat_map(|s| s.qubits.iter().copied()).sorted().dedup() {
        encoder.open_wire(qubit);
    }
    for spec in specs {
        encoder.push(spec)?;
    }
    let (nodes, summary) = encoder.finish();
    Ok((nodes.into_iter().collect(), summary))
}

/// Streaming ingestion in bounded windows.
#[derive(Debug, Clone)]
pub struct WindowedIngestor {
    encoder: Encoder,
    window_size: usize,
    windows: usize,
}

impl WindowedIngestor {
    /// Start a new run, assigning ids consecutively from `start`.
    pub fn new(options: &IngestOptions, start: GateId) -> Result<Self, IngestError> {
        Self::resume(options, start, BTreeMap::new())
    }

    /// Start a run that continues the wires in `open_wires`, as reported by
    /// an earlier run's [`IngestSummary::open_wires`].
    pub fn resume(
        options: &IngestOptions,
        start: GateId,
        open_wires: BTreeMap<Qubit, Link>,
    ) -> Result<Self, IngestError> {
        options.validate()?;
        Ok(Self {
            encoder: Encoder::new(options, start, open_wires),
            window_size: options.window_size,
            windows: 0,
        })
    }

    /// Maximum number of operations accepted per window.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of nodes currently held in memory.
    pub fn pending(&self) -> usize {
        self.encoder.pending.len()
    }

    /// Encode one window of operations and return the nodes that are now
    /// complete, in id order.
    ///
    /// Fails with [`IngestError::InvalidConfiguration`] if the window holds
    /// more than [`WindowedIngestor::window_size`] operations.
    pub fn push_window(
        &mut self,
        specs: impl IntoIterator<Item = GateSpec>,
    ) -> Result<Vec<GateNode>, IngestError> {
        let mut count = 0;
        for spec in specs {
            count += 1;
            if count > self.window_size {
                return Err(IngestError::InvalidConfiguration {
                    reason: format!("window exceeds {} operations", self.window_size),
                });
            }
            self.encoder.push(spec)?;
        }
        self.windows += 1;
        let evicted = self.encoder.evict_resolved();
        tracing::trace!(
            target: PROGRESS_TARGET,
            window = self.windows,
            evicted = evicted.len(),
            pending = self.pending(),
            "ingested window"
        );
        Ok(evicted)
    }

    /// Close all open wires and return every remaining node.
    pub fn finish(self) -> (Vec<GateNode>, IngestSummary) {
        self.encoder.finish()
    }
}

/// Ingest a circuit window by window, handing complete nodes to `persist`.
#[tracing::instrument(target = "linkcirc::metrics", skip_all)]
pub fn ingest_windowed<'a, T: GateTranslator>(
    translator: &T,
    ops: impl IntoIterator<Item = &'a T::Op>,
    options: &IngestOptions,
    start: GateId,
    mut persist: impl FnMut(&[GateNode]) -> Result<(), IngestError>,
) -> Result<IngestSummary, IngestError>
where
    T::Op: 'a,
{
    let mut ingestor = WindowedIngestor::new(options, start)?;
    for window in &ops.into_iter().chunks(options.window_size) {
        let specs = window
            .map(|op| translator.encode_op(op))
            .collect::<Result<Vec<_>, _>>()?;
        let done = ingestor.push_window(specs)?;
        persist(&done)?;
    }
    let (rest, summary) = ingestor.finish();
    persist(&rest)?;
    Ok(summary)
}

/// Ingest a circuit into a store, starting at the store's next free id.
///
/// Every window is written inside a single transaction holding the write
/// lock. If any operation is rejected, nothing is written.
pub fn ingest_into_store<'a, T: GateTranslator>(
    store: &mut GraphStore,
    translator: &T,
    ops: impl IntoIterator<Item = &'a T::Op>,
    options: &IngestOptions,
) -> Result<IngestSummary, IngestError>
where
    T::Op: 'a,
{
    let tx = store.immediate_transaction()?;
    let start = GateId::new(read_next_id(&tx)?);
    let summary = ingest_windowed(translator, ops, options, start, |nodes| {
        insert_rows(&tx, nodes)?;
        Ok(())
    })
    .inspect_err(|e| {
        tracing::warn!(target: LOG_TARGET, label = options.label, "ingestion rolled back: {e}");
    })?;
    raise_watermark(&tx, summary.next_id.index())?;
    tx.commit().map_err(StoreError::from)?;
    tracing::info!(
        target: LOG_TARGET,
        label = options.label,
        operations = summary.operations,
        qubits = summary.inputs.len().max(summary.outputs.len()),
        "ingested circuit"
    );
    Ok(summary)
}

/// Errors while ingesting a circuit.
#[derive(Debug, Display, From, Error)]
#[non_exhaustive]
pub enum IngestError {
    /// An operation has no linked-graph representation.
    UnsupportedOperation(UnsupportedOperation),
    /// The options or the input shape were rejected before any work.
    #[display("Invalid ingestion configuration: {reason}")]
    #[from(ignore)]
    InvalidConfiguration {
        /// What was wrong.
        reason: String,
    },
    /// Persisting nodes failed.
    Store(StoreError),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::serialize::DirectTranslator;
    use crate::utils::test::{id, line, port};
    use cool_asserts::assert_matches;
    use rstest::rstest;

    fn cx(a: usize, b: usize) -> GateSpec {
        GateSpec::new(GateCode::CX, [a, b])
    }

    #[test]
    fn batch_two_cx() {
        let ops = [cx(1, 2), cx(1, 2)];
        let (circ, summary) =
            ingest(&DirectTranslator, &ops, &IngestOptions::default(), id(0)).unwrap();
        circ.check_closed().unwrap();
        assert_eq!(circ.len(), 6);
        assert_eq!(circ.num_operations(), 2);
        // In sentinels come first.
        assert_eq!(summary.inputs[&Qubit::new(1)], id(0));
        assert_eq!(summary.inputs[&Qubit::new(2)], id(1));
        let first = circ.get(id(2)).unwrap();
        assert_eq!(first.next(port(0)), Some(Link::new(id(3), port(0))));
        assert_eq!(first.next(port(1)), Some(Link::new(id(3), port(1))));
        assert_eq!(summary.next_id, id(6));
    }

    #[test]
    fn switch_flag() {
        let ops = [cx(3, 0), GateSpec::new(GateCode::CCX, [2, 0, 1])];
        let (circ, _) = ingest(&DirectTranslator, &ops, &IngestOptions::default(), id(0)).unwrap();
        circ.check_closed().unwrap();
        let cx = circ.nodes().find(|n| n.code == GateCode::CX).unwrap();
        assert!(cx.switch);
        // Qubit 0 sits on port 0 and continues into port 1 of the Toffoli.
        let ccx = circ.nodes().find(|n| n.code == GateCode::CCX).unwrap();
        assert!(!ccx.switch);
        assert_eq!(cx.next(port(0)), Some(ccx.link_to(port(1))));
    }

    #[test]
    fn no_margins() {
        let options = IngestOptions {
            margins: false,
            ..Default::default()
        };
        let ops = [GateSpec::new(GateCode::H, [0]), cx(0, 1)];
        let (circ, summary) = ingest(&DirectTranslator, &ops, &options, id(10)).unwrap();
        assert_eq!(circ.len(), 2);
        assert!(summary.inputs.is_empty());
        circ.check_invariants().unwrap();
        assert!(circ.check_closed().is_err());
        assert_eq!(circ.get(id(10)).unwrap().prev(port(0)), None);
    }

    #[test]
    fn unsupported() {
        let ops = [GateSpec::new(GateCode::Out, [0])];
        assert_matches!(
            ingest(&DirectTranslator, &ops, &IngestOptions::default(), id(0)),
            Err(IngestError::UnsupportedOperation(_))
        );
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    fn rejects_small_windows(#[case] window_size: usize) {
        let options = IngestOptions {
            window_size,
            ..Default::default()
        };
        assert_matches!(
            WindowedIngestor::new(&options, id(0)),
            Err(IngestError::InvalidConfiguration { .. })
        );
    }

    #[test]
    fn window_bounds_memory() {
        let options = IngestOptions {
            window_size: 4,
            ..Default::default()
        };
        let mut ingestor = WindowedIngestor::new(&options, id(0)).unwrap();
        let mut done = Vec::new();
        for _ in 0..10 {
            let window = (0..4).map(|i| GateSpec::new(GateCode::H, [i % 2]));
            done.extend(ingestor.push_window(window).unwrap());
            // Only the last gate on each wire is still waiting.
            assert_eq!(ingestor.pending(), 2);
        }
        let (rest, summary) = ingestor.finish();
        done.extend(rest);
        assert_eq!(summary.operations, 40);
        assert_eq!(summary.peak_pending, 6);
        let circ: LinkedCircuit = done.into_iter().collect();
        assert_eq!(circ.len(), 44);
        circ.check_closed().unwrap();
    }

    #[test]
    fn oversized_window() {
        let options = IngestOptions {
            window_size: 2,
            ..Default::default()
        };
        let mut ingestor = WindowedIngestor::new(&options, id(0)).unwrap();
        let window = (0..3).map(|_| GateSpec::new(GateCode::X, [0]));
        assert_matches!(
            ingestor.push_window(window),
            Err(IngestError::InvalidConfiguration { .. })
        );
    }

    #[test]
    fn into_store() {
        let mut store = GraphStore::open_in_memory().unwrap();
        let ops = (0..25).map(|i| GateSpec::new(GateCode::T, [i % 5])).collect_vec();
        let options = IngestOptions {
            label: 3,
            window_size: 10,
            ..Default::default()
        };
        let summary = ingest_into_store(&mut store, &DirectTranslator, &ops, &options).unwrap();
        assert_eq!(summary.operations, 25);
        assert_eq!(store.count_operations(3).unwrap(), 25);
        assert_eq!(store.count_nodes(3).unwrap(), 35);
        assert_eq!(store.next_id().unwrap(), 35);
        assert_eq!(summary.open_wires.len(), 5);
        store.load_label(3).unwrap().check_closed().unwrap();
    }

    /// Four valid operations followed by one with the wrong operand count.
    fn failing_ops() -> Vec<GateSpec> {
        vec![
            GateSpec::new(GateCode::H, [0]),
            GateSpec::new(GateCode::H, [0]),
            GateSpec::new(GateCode::X, [0]),
            GateSpec::new(GateCode::X, [0]),
            GateSpec::new(GateCode::H, [0, 1]),
        ]
    }

    #[test]
    fn batch_failure() {
        assert_matches!(
            ingest(&DirectTranslator, &failing_ops(), &IngestOptions::default(), id(0)),
            Err(IngestError::UnsupportedOperation(UnsupportedOperation { op, .. })) => {
                assert_eq!(op, "H");
            }
        );
    }

    #[test]
    fn windowed_failure_stops_persisting() {
        let options = IngestOptions {
            window_size: 2,
            ..Default::default()
        };
        let ops = failing_ops();
        let mut persisted = Vec::new();
        let result = ingest_windowed(&DirectTranslator, &ops, &options, id(0), |nodes| {
            persisted.extend_from_slice(nodes);
            Ok(())
        });
        assert_matches!(result, Err(IngestError::UnsupportedOperation(_)));
        // Only the nodes resolved by the first two windows were handed out.
        assert_eq!(persisted.iter().map(|n| n.id).collect_vec(), [id(0), id(1), id(2), id(3)]);
    }

    #[test]
    fn store_failure_rolls_back() {
        let mut store = GraphStore::open_in_memory().unwrap();
        let kept = line(&[GateCode::T]);
        store.insert_circuit(&kept).unwrap();
        let options = IngestOptions {
            label: 5,
            window_size: 2,
            ..Default::default()
        };

        let ops = failing_ops();
        assert_matches!(
            ingest_into_store(&mut store, &DirectTranslator, &ops, &options),
            Err(IngestError::UnsupportedOperation(_))
        );
        assert_eq!(store.count_nodes(5).unwrap(), 0);
        assert_eq!(store.next_id().unwrap(), 3);
        assert_eq!(store.load_label(0).unwrap(), kept);

        // The store is still usable, and the failed run left no ids behind.
        let summary =
            ingest_into_store(&mut store, &DirectTranslator, &ops[..4], &options).unwrap();
        assert_eq!(summary.inputs[&Qubit::new(0)], id(3));
        store.load_label(5).unwrap().check_closed().unwrap();
    }

    #[test]
    fn resumed_wires() {
        let open = IngestOptions {
            margins: false,
            ..Default::default()
        };
        let first_ops = [GateSpec::new(GateCode::H, [0]), cx(1, 0)];
        let (mut circ, first) = ingest(&DirectTranslator, &first_ops, &open, id(0)).unwrap();
        // The CX has its operands switched: qubit 0 sits on port 0.
        assert_eq!(first.open_wires[&Qubit::new(0)], Link::new(id(1), port(0)));
        assert_eq!(first.open_wires[&Qubit::new(1)], Link::new(id(1), port(1)));
        assert!(first.boundary.is_empty());

        let second_ops = [GateSpec::new(GateCode::X, [1]), GateSpec::new(GateCode::H, [2])];
        let (rest, second) = ingest_resumed(
            &DirectTranslator,
            &second_ops,
            &IngestOptions::default(),
            first.next_id,
            first.open_wires.clone(),
        )
        .unwrap();
        // Only the new qubit gets an `In` sentinel.
        assert_eq!(second.inputs.keys().copied().collect_vec(), [Qubit::new(2)]);
        assert_eq!(second.outputs.len(), 3);
        assert_eq!(second.boundary.len(), 2);

        circ.extend(rest.into_nodes());
        second.stitch(&mut circ);
        circ.check_invariants().unwrap();
        let x = circ.nodes().find(|n| n.code == GateCode::X).unwrap();
        assert_eq!(x.prev(port(0)), Some(Link::new(id(1), port(1))));
        assert_eq!(circ.get(id(1)).unwrap().next(port(1)), Some(x.link_to(port(0))));
        let out = second.outputs[&Qubit::new(0)];
        assert_eq!(circ.get(id(1)).unwrap().next(port(0)), Some(Link::new(out, port(0))));

        // Windowed ingestion continues the same wires.
        let mut windowed =
            WindowedIngestor::resume(&IngestOptions::default(), first.next_id, first.open_wires)
                .unwrap();
        let mut nodes = windowed.push_window(second_ops).unwrap();
        let (tail, summary) = windowed.finish();
        nodes.extend(tail);
        assert_eq!(nodes.len(), 6);
        let sources = |s: &IngestSummary| s.boundary.iter().map(|&(from, _)| from).collect_vec();
        assert_eq!(sources(&summary), sources(&second));
    }
}
