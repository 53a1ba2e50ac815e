//! Gate codes stored in the linked circuit graph.

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use strum::{EnumIter, EnumString, FromRepr, IntoStaticStr};

/// Tolerance used when comparing rotation parameters.
pub const PARAM_TOLERANCE: f64 = 1e-9;

#[derive(
    Clone,
    Copy,
    Debug,
    Serialize,
    Deserialize,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    EnumIter,
    IntoStaticStr,
    EnumString,
    FromRepr,
)]
#[repr(u8)]
#[non_exhaustive]
/// Closed set of operations a [`GateNode`][crate::circuit::GateNode] can hold.
///
/// The discriminant is the integer tag persisted in the store. Rotation
/// parameters are expressed in half-turns.
//
// When adding new operations, make sure to also edit:
// - `GateCode::arity` and `GateCode::inverse` in this same file
// - `GateCode::t_count` if the gate contributes to the T-count
pub enum GateCode {
    // Sentinels
    /// Start of a wire. Has no predecessor.
    In = 0,
    /// End of a wire. Has no successor.
    Out = 1,

    // Single-qubit gates
    /// Hadamard gate
    H = 2,
    /// Pauli X
    X = 3,
    /// Pauli Y
    Y = 4,
    /// Pauli Z
    Z = 5,
    /// S gate
    S = 6,
    /// Inverse S gate
    Sdg = 7,
    /// T gate
    T = 8,
    /// Inverse T gate
    Tdg = 9,
    /// SX gate
    SX = 10,
    /// Inverse SX gate
    SXdg = 11,
    /// X rotation with an angle parameter in half-turns
    Rx = 12,
    /// Y rotation with an angle parameter in half-turns
    Ry = 13,
    /// Z rotation with an angle parameter in half-turns
    Rz = 14,
    /// Measurement, optionally tagged with a measurement key
    Measure = 15,
    /// Reset qubit to |0>
    Reset = 16,

    // Two-qubit gates
    /// Controlled X gate
    CX = 20,
    /// Controlled Y gate
    CY = 21,
    /// Controlled Z gate
    CZ = 22,
    /// Controlled Z rotation with an angle parameter in half-turns
    CRz = 23,
    /// Swap two qubits
    SWAP = 24,
    /// ZZPhase gate, with a parameter in half-turns
    ZZPhase = 25,

    // Three-qubit gates
    /// Toffoli gate, or double-controlled X gate
    CCX = 30,
    /// Controlled qubit swap
    CSWAP = 31,
}

impl GateCode {
    /// The number of qubits (and therefore ports) the operation acts on.
    pub fn arity(self) -> usize {
        match self {
            GateCode::CX
            | GateCode::CY
            | GateCode::CZ
            | GateCode::CRz
            | GateCode::SWAP
            | GateCode::ZZPhase => 2,
            GateCode::CCX | GateCode::CSWAP => 3,
            GateCode::In
            | GateCode::Out
            | GateCode::H
            | GateCode::X
            | GateCode::Y
            | GateCode::Z
            | GateCode::S
            | GateCode::Sdg
            | GateCode::T
            | GateCode::Tdg
            | GateCode::SX
            | GateCode::SXdg
            | GateCode::Rx
            | GateCode::Ry
            | GateCode::Rz
            | GateCode::Measure
            | GateCode::Reset => 1,
        }
    }

    /// Whether the code marks a wire endpoint rather than an operation.
    pub fn is_sentinel(self) -> bool {
        matches!(self, GateCode::In | GateCode::Out)
    }

    /// Whether the operation carries a rotation parameter.
    pub fn is_rotation(self) -> bool {
        matches!(
            self,
            GateCode::Rx | GateCode::Ry | GateCode::Rz | GateCode::CRz | GateCode::ZZPhase
        )
    }

    /// The gate code of the inverse operation, for parameter-free gates.
    ///
    /// Rotations are their own inverse family: the inverse of a rotation is
    /// the same code with the opposite parameter. Non-unitary operations and
    /// sentinels have no inverse.
    pub fn inverse(self) -> Option<GateCode> {
        use GateCode::*;
        match self {
            H | X | Y | Z | CX | CY | CZ | SWAP | CCX | CSWAP => Some(self),
            S => Some(Sdg),
            Sdg => Some(S),
            T => Some(Tdg),
            Tdg => Some(T),
            SX => Some(SXdg),
            SXdg => Some(SX),
            Rx | Ry | Rz | CRz | ZZPhase => Some(self),
            In | Out | Measure | Reset => None,
        }
    }

    /// Whether an operation `(other, other_param)` undoes `(self, param)`.
    pub fn is_inverse_of(self, param: f64, other: GateCode, other_param: f64) -> bool {
        if self.inverse() != Some(other) {
            return false;
        }
        if self.is_rotation() {
            return (param + other_param).abs() < PARAM_TOLERANCE;
        }
        true
    }

    /// The T-count contribution of one operation.
    ///
    /// T and T† count once, as does a Z rotation by a quarter half-turn.
    pub fn t_count(self, param: f64) -> usize {
        match self {
            GateCode::T | GateCode::Tdg => 1,
            GateCode::Rz if (param.abs() - 0.25).abs() < PARAM_TOLERANCE => 1,
            _ => 0,
        }
    }

    /// The integer tag persisted in the store.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Recover a gate code from its persisted tag.
    pub fn from_tag(tag: u8) -> Result<Self, UnknownGateCode> {
        Self::from_repr(tag).ok_or(UnknownGateCode { tag })
    }

    /// The operation name, as used in serialised circuits.
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// A persisted tag that does not correspond to any [`GateCode`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Error)]
#[display("{tag} is not a known gate code.")]
pub struct UnknownGateCode {
    /// The offending tag.
    pub tag: u8,
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn tags_round_trip() {
        for code in GateCode::iter() {
            assert_eq!(GateCode::from_tag(code.tag()), Ok(code));
            assert_eq!(GateCode::from_str(code.name()), Ok(code));
        }
        assert_eq!(GateCode::from_tag(99), Err(UnknownGateCode { tag: 99 }));
    }

    #[rstest]
    #[case(GateCode::In, 1)]
    #[case(GateCode::Rz, 1)]
    #[case(GateCode::CX, 2)]
    #[case(GateCode::ZZPhase, 2)]
    #[case(GateCode::CSWAP, 3)]
    fn arity(#[case] code: GateCode, #[case] expected: usize) {
        assert_eq!(code.arity(), expected);
    }

    #[test]
    fn arity_follows_tag_range() {
        // Tags 20..30 are two-qubit gates and 30.. three-qubit gates.
        for code in GateCode::iter() {
            let expected = match code.tag() {
                0..20 => 1,
                20..30 => 2,
                _ => 3,
            };
            assert_eq!(code.arity(), expected, "{code:?}");
        }
    }

    #[rstest]
    #[case(GateCode::H, 0.0, GateCode::H, 0.0, true)]
    #[case(GateCode::T, 0.0, GateCode::Tdg, 0.0, true)]
    #[case(GateCode::T, 0.0, GateCode::T, 0.0, false)]
    #[case(GateCode::Rz, 0.3, GateCode::Rz, -0.3, true)]
    #[case(GateCode::Rz, 0.3, GateCode::Rz, 0.3, false)]
    #[case(GateCode::Measure, 0.0, GateCode::Measure, 0.0, false)]
    fn inverse_pairs(
        #[case] a: GateCode,
        #[case] pa: f64,
        #[case] b: GateCode,
        #[case] pb: f64,
        #[case] expected: bool,
    ) {
        assert_eq!(a.is_inverse_of(pa, b, pb), expected);
    }

    #[test]
    fn t_count() {
        assert_eq!(GateCode::T.t_count(0.0), 1);
        assert_eq!(GateCode::Rz.t_count(-0.25), 1);
        assert_eq!(GateCode::Rz.t_count(0.5), 0);
        assert_eq!(GateCode::H.t_count(0.0), 0);
    }
}
