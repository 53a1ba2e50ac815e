//! A JSON circuit format with named qubits.
//!
//! ```json
//! {
//!     "qubits": ["q0", "q1"],
//!     "commands": [
//!         {"op": {"type": "H"}, "args": ["q0"]},
//!         {"op": {"type": "CX"}, "args": ["q0", "q1"]},
//!         {"op": {"type": "Rz", "params": [0.25]}, "args": ["q1"]}
//!     ]
//! }
//! ```

use std::path::Path;
use std::str::FromStr;
use std::{fs, io};

use derive_more::{Display, Error, From};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::{GateSpec, GateTranslator, Qubit, UnsupportedOperation};
use crate::ops::GateCode;

/// A serialised circuit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerialCircuit {
    /// Qubit names, in wire order.
    pub qubits: Vec<String>,
    /// Operations, in program order.
    pub commands: Vec<SerialCommand>,
}

/// One serialised operation applied to named qubits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialCommand {
    /// The operation.
    pub op: SerialOp,
    /// Operand qubit names.
    pub args: Vec<String>,
    /// Whether the operation is classically conditioned.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub conditional: bool,
    /// Measurement key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// A serialised operation type with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialOp {
    /// The operation name, e.g. `"CX"`.
    #[serde(rename = "type")]
    pub op_type: String,
    /// Rotation parameter, in half-turns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<f64>,
    /// Global phase shift.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<f64>,
}

impl SerialCircuit {
    /// A translator for this circuit's qubit names.
    pub fn translator(&self) -> SerialTranslator {
        SerialTranslator::new(self.qubits.iter().cloned())
    }
}

/// Maps [`SerialCommand`]s to [`GateSpec`]s, resolving qubit names to
/// indices by their position in the circuit's qubit list.
#[derive(Debug, Clone, Default)]
pub struct SerialTranslator {
    names: Vec<String>,
    indices: FxHashMap<String, Qubit>,
}

impl SerialTranslator {
    /// Create a translator over the given qubit names.
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        let names: Vec<String> = names.into_iter().collect();
        let indices = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), Qubit::new(i)))
            .collect();
        Self { names, indices }
    }

    /// The qubit names.
    pub fn qubit_names(&self) -> &[String] {
        &self.names
    }

    /// The index of a named qubit.
    pub fn qubit(&self, name: &str) -> Option<Qubit> {
        self.indices.get(name).copied()
    }

    fn qubit_name(&self, qb: Qubit) -> String {
        self.names
            .get(qb.index())
            .cloned()
            .unwrap_or_else(|| format!("q{}", qb.index()))
    }
}

impl GateTranslator for SerialTranslator {
    type Op = SerialCommand;

    fn encode_op(&self, cmd: &SerialCommand) -> Result<GateSpec, UnsupportedOperation> {
        let code = GateCode::from_str(&cmd.op.op_type)
            .map_err(|_| UnsupportedOperation::new(&cmd.op.op_type, "unknown operation type"))?;
        let qubits = cmd
            .args
            .iter()
            .map(|name| {
                self.qubit(name).ok_or_else(|| {
                    UnsupportedOperation::new(
                        &cmd.op.op_type,
                        format!("unknown qubit {name}"),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let spec = GateSpec {
            code,
            qubits,
            parameter: cmd.op.params.first().copied().unwrap_or_default(),
            global_shift: cmd.op.phase.unwrap_or_default(),
            classically_controlled: cmd.conditional,
            measurement_key: cmd.key.clone(),
        };
        spec.validate()?;
        Ok(spec)
    }

    fn decode_op(&self, spec: GateSpec) -> Result<SerialCommand, UnsupportedOperation> {
        spec.validate()?;
        let params = match spec.code.is_rotation() {
            true => vec![spec.parameter],
            false => vec![],
        };
        let phase = (spec.global_shift != 0.0).then_some(spec.global_shift);
        Ok(SerialCommand {
            op: SerialOp {
                op_type: spec.code.name().to_string(),
                params,
                phase,
            },
            args: spec.qubits.iter().map(|&q| self.qubit_name(q)).collect(),
            conditional: spec.classically_controlled,
            key: spec.measurement_key,
        })
    }
}

/// Load a serialised circuit from a JSON file.
pub fn load_json_file(path: impl AsRef<Path>) -> Result<SerialCircuit, JsonError> {
    let file = fs::File::open(path)?;
    let reader = io::BufReader::new(file);
    load_json_reader(reader)
}

/// Load a serialised circuit from a reader.
pub fn load_json_reader(json: impl io::Read) -> Result<SerialCircuit, JsonError> {
    Ok(serde_json::from_reader(json)?)
}

/// Load a serialised circuit from a JSON string.
pub fn load_json_str(json: &str) -> Result<SerialCircuit, JsonError> {
    Ok(serde_json::from_str(json)?)
}

/// Save a serialised circuit to a JSON file.
pub fn save_json_file(circ: &SerialCircuit, path: impl AsRef<Path>) -> Result<(), JsonError> {
    let file = fs::File::create(path)?;
    let writer = io::BufWriter::new(file);
    save_json_writer(circ, writer)
}

/// Save a serialised circuit to a writer.
pub fn save_json_writer(circ: &SerialCircuit, w: impl io::Write) -> Result<(), JsonError> {
    serde_json::to_writer(w, circ)?;
    Ok(())
}

/// Errors while reading or writing serialised circuits.
#[derive(Debug, Display, From, Error)]
#[non_exhaustive]
pub enum JsonError {
    /// Could not read or write the file.
    #[display("IO error: {_0}")]
    Io(io::Error),
    /// Invalid JSON.
    #[display("Invalid circuit JSON: {_0}")]
    Json(serde_json::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use cool_asserts::assert_matches;

    const BELL: &str = r#"{
        "qubits": ["a", "b"],
        "commands": [
            {"op": {"type": "H"}, "args": ["a"]},
            {"op": {"type": "CX"}, "args": ["b", "a"]},
            {"op": {"type": "Rz", "params": [0.25]}, "args": ["b"]},
            {"op": {"type": "Measure"}, "args": ["a"], "key": "m0"}
        ]
    }"#;

    #[test]
    fn encode_decode_commands() {
        let circ = load_json_str(BELL).unwrap();
        let tr = circ.translator();

        let specs: Vec<GateSpec> = circ
            .commands
            .iter()
            .map(|c| tr.encode_op(c).unwrap())
            .collect();
        assert_eq!(specs[1], GateSpec::new(GateCode::CX, [1, 0]));
        assert_eq!(specs[2].parameter, 0.25);
        assert_eq!(specs[3].measurement_key.as_deref(), Some("m0"));

        let back: Vec<SerialCommand> = specs
            .into_iter()
            .map(|s| tr.decode_op(s).unwrap())
            .collect();
        assert_eq!(back, circ.commands);
    }

    #[test]
    fn unsupported() {
        let tr = SerialTranslator::new(["q".to_string()]);
        let cmd = SerialCommand {
            op: SerialOp {
                op_type: "Barrier".to_string(),
                params: vec![],
                phase: None,
            },
            args: vec!["q".to_string()],
            conditional: false,
            key: None,
        };
        assert_matches!(tr.encode_op(&cmd), Err(UnsupportedOperation { op, .. }) => {
            assert_eq!(op, "Barrier");
        });
    }

    #[test]
    fn invalid_json() {
        assert_matches!(load_json_str("{"), Err(JsonError::Json(_)));
    }
}
