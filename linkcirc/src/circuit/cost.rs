//! Resource costs aggregated over groups of gate nodes.

use derive_more::{Add, AddAssign, Sum};
use serde::{Deserialize, Serialize};

/// The cost of a group of operations, as bounded by widgetization.
///
/// `depth` counts the operations in the group, `t_count` the T-type gates
/// among them.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Add,
    AddAssign,
    Sum,
    Serialize,
    Deserialize,
)]
pub struct WidgetCost {
    /// Number of operations.
    pub depth: usize,
    /// Number of T/T† gates.
    pub t_count: usize,
}

impl WidgetCost {
    /// Whether the cost stays within both ceilings.
    #[inline]
    pub fn within(&self, max_t: usize, max_d: usize) -> bool {
        self.t_count <= max_t && self.depth <= max_d
    }
}
