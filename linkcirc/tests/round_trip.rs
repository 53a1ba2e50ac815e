//! Ingestion and reconstruction through a persistent store.

use std::collections::BTreeMap;

use linkcirc::ingest::{ingest, ingest_into_store, IngestOptions};
use linkcirc::reconstruct::{moments, reconstruct, reconstruct_label, ReconstructOptions};
use linkcirc::serialize::{
    load_json_file, load_json_str, save_json_file, DirectTranslator, GateSpec, Qubit,
    SerialCircuit,
};
use linkcirc::{GateCode, GateId, GraphStore, StoreConfig};
use rstest::{fixture, rstest};

/// Three qubits, mixing single-, two- and three-qubit operations, with some
/// two-qubit operands in descending order.
#[fixture]
fn mixed_circ() -> SerialCircuit {
    let json = r#"{
        "qubits": ["a", "b", "c"],
        "commands": [
            {"op": {"type": "H"}, "args": ["a"]},
            {"op": {"type": "CX"}, "args": ["c", "a"]},
            {"op": {"type": "Rz", "params": [0.25]}, "args": ["b"]},
            {"op": {"type": "CCX"}, "args": ["b", "a", "c"]},
            {"op": {"type": "ZZPhase", "params": [-0.5]}, "args": ["b", "a"]},
            {"op": {"type": "T"}, "args": ["c"]},
            {"op": {"type": "Measure"}, "args": ["a"], "key": "m0"},
            {"op": {"type": "X"}, "args": ["c"], "conditional": true}
        ]
    }"#;
    load_json_str(json).unwrap()
}

/// The operations acting on each qubit, in order.
fn per_qubit(circ: &SerialCircuit) -> BTreeMap<String, Vec<String>> {
    let mut wires: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for cmd in &circ.commands {
        for arg in &cmd.args {
            wires
                .entry(arg.clone())
                .or_default()
                .push(format!("{}{:?}", cmd.op.op_type, cmd.op.params));
        }
    }
    wires
}

#[test]
fn two_cx_in_order() {
    let ops = [
        GateSpec::new(GateCode::CX, [1, 2]),
        GateSpec::new(GateCode::CX, [1, 2]),
    ];
    let (circ, summary) =
        ingest(&DirectTranslator, &ops, &IngestOptions::default(), GateId::new(0)).unwrap();
    assert_eq!(circ.num_operations(), 2);
    assert_eq!(circ.len() - circ.num_operations(), 4);

    let options = ReconstructOptions {
        wire_order: Some(summary.wire_order()),
        ..Default::default()
    };
    let rebuilt = reconstruct(&circ, &DirectTranslator, &options).unwrap();
    assert_eq!(rebuilt.depth(), 2);
    assert_eq!(rebuilt.into_gates(), ops);
}

#[rstest]
fn json_through_store(mixed_circ: SerialCircuit) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.json");
    let output = dir.path().join("output.json");
    save_json_file(&mixed_circ, &input).unwrap();

    let config = StoreConfig::new(dir.path().join("graph.db"));
    let circ = load_json_file(&input).unwrap();
    let translator = circ.translator();
    let options = IngestOptions {
        label: 7,
        window_size: 2,
        ..Default::default()
    };
    let summary = {
        let mut store = config.open().unwrap();
        ingest_into_store(&mut store, &translator, &circ.commands, &options).unwrap()
    };
    assert_eq!(summary.operations, 8);

    // A fresh connection sees the persisted graph.
    let store = config.open().unwrap();
    assert_eq!(store.count_operations(7).unwrap(), 8);
    store.load_label(7).unwrap().check_closed().unwrap();

    let rebuilt = reconstruct_label(
        &store,
        7,
        &translator,
        &ReconstructOptions {
            wire_order: Some(summary.wire_order()),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(rebuilt.num_qubits, 3);
    let result = SerialCircuit {
        qubits: circ.qubits.clone(),
        commands: rebuilt.into_gates(),
    };
    save_json_file(&result, &output).unwrap();
    let result = load_json_file(&output).unwrap();

    assert_eq!(result.commands.len(), circ.commands.len());
    assert_eq!(per_qubit(&result), per_qubit(&circ));
    // Operand order and the extra fields survive.
    for cmd in &circ.commands {
        assert!(result.commands.contains(cmd), "{cmd:?} was lost");
    }
}

#[test]
fn windowed_many_qubits() {
    const NUM_OPS: usize = 10_000;
    const NUM_QUBITS: usize = 50;
    let ops: Vec<GateSpec> = (0..NUM_OPS)
        .map(|i| GateSpec::new(GateCode::Rz, [(i * 7) % NUM_QUBITS]).with_parameter(i as f64))
        .collect();

    let mut store = GraphStore::open_in_memory().unwrap();
    let options = IngestOptions {
        window_size: 1000,
        ..Default::default()
    };
    let summary = ingest_into_store(&mut store, &DirectTranslator, &ops, &options).unwrap();
    assert_eq!(store.count_operations(0).unwrap(), NUM_OPS);
    assert_eq!(store.count_nodes(0).unwrap(), NUM_OPS + 2 * NUM_QUBITS);
    // Only the open wires and one window stay in memory.
    assert!(summary.peak_pending <= 1000 + 2 * NUM_QUBITS);

    let circ = store.load_label(0).unwrap();
    circ.check_closed().unwrap();
    let rebuilt = reconstruct(
        &circ,
        &DirectTranslator,
        &ReconstructOptions {
            wire_order: Some(summary.wire_order()),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(rebuilt.num_qubits, NUM_QUBITS);

    let params_on = |ops: &[GateSpec], qb: usize| -> Vec<f64> {
        ops.iter()
            .filter(|op| op.qubits == [Qubit::new(qb)])
            .map(|op| op.parameter)
            .collect()
    };
    let gates = rebuilt.into_gates();
    for qb in 0..NUM_QUBITS {
        assert_eq!(params_on(&gates[..], qb), params_on(&ops[..], qb));
    }
}

#[rstest]
fn moments_follow_links(mixed_circ: SerialCircuit) {
    let (circ, _) = ingest(
        &mixed_circ.translator(),
        &mixed_circ.commands,
        &IngestOptions::default(),
        GateId::new(100),
    )
    .unwrap();
    circ.check_closed().unwrap();
    let moments = moments(&circ).unwrap();
    for node in circ.nodes() {
        for (_, pred) in node.predecessors() {
            assert!(moments[&node.id] > moments[&pred.id]);
        }
        // Every link is mirrored.
        for (port, succ) in node.successors() {
            let target = circ.get(succ.id).unwrap();
            assert_eq!(target.prev(succ.port), Some(node.link_to(port)));
        }
    }
}
