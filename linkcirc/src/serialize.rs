//! The codec boundary between native circuit operations and gate nodes.
//!
//! The ingestion pipeline and the reconstructor never look at native
//! operations directly. They go through a [`GateTranslator`], which maps an
//! operation to a [`GateSpec`] (gate code, operand qubits, parameters) and
//! back. Operations without a graph representation are reported as
//! [`UnsupportedOperation`].
//!
//! [`DirectTranslator`] uses [`GateSpec`] itself as the native operation.
//! See [`json`] for a serialised circuit format with its own translator.
pub mod json;

pub use json::{
    load_json_file, load_json_reader, load_json_str, save_json_file, save_json_writer,
    SerialCircuit, SerialCommand, SerialOp, SerialTranslator,
};

use derive_more::{Display, Error, From, Into};
use serde::{Deserialize, Serialize};

use crate::ops::GateCode;

/// A qubit index, as seen by a [`GateTranslator`].
#[repr(transparent)]
#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    From,
    Into,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Qubit(usize);

impl Qubit {
    /// Create a qubit index.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The qubit index.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Everything the linked graph records about one operation.
///
/// `qubits` are in operand order (control first), regardless of how the
/// operation is laid out on the ports of its node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    /// The operation kind.
    pub code: GateCode,
    /// Operand qubits.
    pub qubits: Vec<Qubit>,
    /// Rotation angle or exponent, in half-turns.
    #[serde(default)]
    pub parameter: f64,
    /// Global phase shift.
    #[serde(default)]
    pub global_shift: f64,
    /// Whether the operation is conditioned on a classical bit.
    #[serde(default)]
    pub classically_controlled: bool,
    /// Measurement key, for measurements.
    #[serde(default)]
    pub measurement_key: Option<String>,
}

impl GateSpec {
    /// A parameter-free operation on the given qubits.
    pub fn new(code: GateCode, qubits: impl IntoIterator<Item = usize>) -> Self {
        Self {
            code,
            qubits: qubits.into_iter().map(Qubit).collect(),
            parameter: 0.0,
            global_shift: 0.0,
            classically_controlled: false,
            measurement_key: None,
        }
    }

    /// Set the rotation parameter.
    pub fn with_parameter(mut self, parameter: f64) -> Self {
        self.parameter = parameter;
        self
    }

    /// Set the measurement key.
    pub fn with_measurement_key(mut self, key: impl Into<String>) -> Self {
        self.measurement_key = Some(key.into());
        self
    }

    /// Check that the spec describes an operation the graph can hold.
    ///
    /// Sentinels are not operations, and the operand count must match the
    /// gate's arity with no repeated qubits.
    pub fn validate(&self) -> Result<(), UnsupportedOperation> {
        if self.code.is_sentinel() {
            return Err(UnsupportedOperation::new(
                self.code.name(),
                "sentinels cannot appear as operations",
            ));
        }
        if self.qubits.len() != self.code.arity() {
            return Err(UnsupportedOperation::new(
                self.code.name(),
                format!(
                    "expected {} operands, got {}",
                    self.code.arity(),
                    self.qubits.len()
                ),
            ));
        }
        for (i, q) in self.qubits.iter().enumerate() {
            if self.qubits[..i].contains(q) {
                return Err(UnsupportedOperation::new(
                    self.code.name(),
                    format!("qubit {q} is used twice"),
                ));
            }
        }
        Ok(())
    }
}

/// Translation between native operations and [`GateSpec`]s.
///
/// Must be total on the operations it accepts, and return
/// [`UnsupportedOperation`] for anything else.
pub trait GateTranslator {
    /// The native operation type.
    type Op;

    /// Describe a native operation for insertion in the graph.
    fn encode_op(&self, op: &Self::Op) -> Result<GateSpec, UnsupportedOperation>;

    /// Rebuild a native operation from a reconstructed node.
    fn decode_op(&self, spec: GateSpec) -> Result<Self::Op, UnsupportedOperation>;
}

/// A translator whose native operations are [`GateSpec`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectTranslator;

impl GateTranslator for DirectTranslator {
    type Op = GateSpec;

    fn encode_op(&self, op: &GateSpec) -> Result<GateSpec, UnsupportedOperation> {
        op.validate()?;
        Ok(op.clone())
    }

    fn decode_op(&self, spec: GateSpec) -> Result<GateSpec, UnsupportedOperation> {
        Ok(spec)
    }
}

/// An operation with no linked-graph representation.
#[derive(Debug, Display, Clone, PartialEq, Eq, Error)]
#[display("Unsupported operation {op}: {reason}.")]
pub struct UnsupportedOperation {
    /// A description of the rejected operation.
    pub op: String,
    /// Why it was rejected.
    pub reason: String,
}

impl UnsupportedOperation {
    /// Create a new error.
    pub fn new(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            reason: reason.into(),
        }
    }
}
