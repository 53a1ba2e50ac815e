//! Port-level adjacency pointers between gate nodes.
//!
//! A [`Link`] names a neighbouring node together with the port on that node
//! the wire attaches to. In the store it is flattened into a single integer,
//! `id * 10 + port`, so that a `prev`/`next` column is both a back/forward
//! reference and a lookup key.

use derive_more::{Display, Error, From, Into};
use serde::{Deserialize, Serialize};

/// Maximum number of ports on a gate node.
pub const MAX_PORTS: usize = 3;

/// Radix used to pack the port index into a link integer.
const PORT_RADIX: i64 = 10;

/// Unique identifier of a gate node.
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
pub struct GateId(i64);

impl GateId {
    /// Create a new gate id.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw integer id.
    pub const fn index(self) -> i64 {
        self.0
    }
}

/// A port index on a gate node, always smaller than [`MAX_PORTS`].
#[repr(transparent)]
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "usize", into = "usize")]
pub struct Port(u8);

impl Port {
    /// The first port, present on every node.
    pub const ZERO: Port = Port(0);

    /// Create a port, rejecting indices `>= MAX_PORTS`.
    pub fn new(index: usize) -> Result<Self, LinkError> {
        if index >= MAX_PORTS {
            return Err(LinkError::InvalidPort { port: index });
        }
        Ok(Self(index as u8))
    }

    /// The port index.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// All ports of a node with the given arity.
    pub fn all(arity: usize) -> impl Iterator<Item = Port> {
        (0..arity.min(MAX_PORTS)).map(|i| Port(i as u8))
    }
}

impl TryFrom<usize> for Port {
    type Error = LinkError;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        Port::new(index)
    }
}

impl From<Port> for usize {
    fn from(port: Port) -> Self {
        port.index()
    }
}

/// A pointer to port `port` of node `id`.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[display("{id}:{port}")]
pub struct Link {
    /// The neighbouring node.
    pub id: GateId,
    /// The port on the neighbouring node.
    pub port: Port,
}

impl Link {
    /// Create a new link.
    pub fn new(id: GateId, port: Port) -> Self {
        Self { id, port }
    }

    /// Encode the link as a single integer.
    ///
    /// Fails if the id is negative or too large to leave room for the port.
    #[inline]
    pub fn encode(self) -> Result<i64, LinkError> {
        self.id
            .0
            .checked_mul(PORT_RADIX)
            .and_then(|raw| raw.checked_add(self.port.0 as i64))
            .filter(|&raw| raw >= 0)
            .ok_or(LinkError::Overflow { id: self.id })
    }

    /// Decode a link integer.
    ///
    /// Fails only if the packed port is not a valid port index, or the value
    /// is negative.
    #[inline]
    pub fn decode(raw: i64) -> Result<Self, LinkError> {
        if raw < 0 {
            return Err(LinkError::Negative { raw });
        }
        let port = Port::new((raw % PORT_RADIX) as usize)?;
        Ok(Self {
            id: GateId(raw / PORT_RADIX),
            port,
        })
    }
}

/// Encode a `(gate_id, port)` pair.
pub fn encode(id: GateId, port: usize) -> Result<i64, LinkError> {
    Link::new(id, Port::new(port)?).encode()
}

/// Decode a link integer into its `(gate_id, port)` pair.
pub fn decode(raw: i64) -> Result<(GateId, usize), LinkError> {
    let link = Link::decode(raw)?;
    Ok((link.id, link.port.index()))
}

/// Errors produced by the link codec.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum LinkError {
    /// A port index outside `0..MAX_PORTS`.
    #[display("Port {port} is out of range, gate nodes have at most 3 ports.")]
    InvalidPort {
        /// The rejected index.
        port: usize,
    },
    /// Links never encode to negative integers.
    #[display("{raw} is not a valid link encoding.")]
    Negative {
        /// The rejected value.
        raw: i64,
    },
    /// The id has no link encoding that fits in an `i64`.
    #[display("Gate id {id} is out of the encodable range.")]
    Overflow {
        /// The rejected id.
        id: GateId,
    },
}
