//! Persistent storage of linked circuits in SQLite.
//!
//! A [`GraphStore`] owns one connection to a database holding four tables:
//!
//! - `linked_circuit`, one row per [`GateNode`], with its links flattened by
//!   [`Link::encode`][crate::link::Link::encode]. Several circuits can share
//!   the table, each selected by its label.
//! - `stop_condition`, a single boolean flag used to cooperatively cancel
//!   concurrent rewrite runs.
//! - `id_sequence`, the next id to hand out. Inserting rows never leaves it
//!   at or below an id in use.
//! - `edge_list`, a derived `(source_id, target_id)` table between
//!   operations, rebuilt on demand with [`GraphStore::rebuild_edge_list`].
//!
//! Connections run in WAL mode with a busy timeout, so that many workers can
//! each open their own [`GraphStore`] on the same file.

mod schema;

use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use derive_more::{Display, Error, From};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

pub(crate) use schema::{delete_node, read_bernoulli, read_block, read_node, write_links};

use crate::circuit::{GateNode, Label, LinkedCircuit};
use crate::link::{GateId, LinkError};
use crate::ops::GateCode;

/// Connection settings for a [`GraphStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the database file.
    pub path: PathBuf,
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("linkcirc.db"),
            busy_timeout_ms: 10_000,
        }
    }
}

impl StoreConfig {
    /// Settings for the database at `path`, with the default busy timeout.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Open a new connection.
    pub fn open(&self) -> Result<GraphStore, StoreError> {
        GraphStore::open(self)
    }
}

/// An edge between two operations, as stored in the edge list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    /// Position in the edge list.
    pub seq: i64,
    /// The earlier operation.
    pub source: GateId,
    /// The later operation.
    pub target: GateId,
}

/// A connection to a database of linked circuits.
#[derive(Debug)]
pub struct GraphStore {
    conn: Connection,
}

impl GraphStore {
    /// Open (and if needed create) the database described by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(schema::CREATE_TABLES)?;
        Ok(Self { conn })
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Start a write transaction, taking the database write lock up front.
    ///
    /// Rewrites read their match again inside such a transaction before
    /// changing it, so a concurrent writer can only make them miss.
    pub fn immediate_transaction(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    /// Insert nodes in a single transaction.
    ///
    /// The id sequence is moved past the largest inserted id. Returns the
    /// number of rows written.
    pub fn insert_nodes<'a>(
        &mut self,
        nodes: impl IntoIterator<Item = &'a GateNode>,
    ) -> Result<usize, StoreError> {
        let tx = self.immediate_transaction()?;
        let count = insert_rows(&tx, nodes)?;
        tx.commit()?;
        Ok(count)
    }

    /// Insert every node of an in-memory circuit.
    pub fn insert_circuit(&mut self, circ: &LinkedCircuit) -> Result<usize, StoreError> {
        self.insert_nodes(circ.nodes())
    }

    /// Load every node with the given label.
    pub fn load_label(&self, label: Label) -> Result<LinkedCircuit, StoreError> {
        Ok(schema::read_label(&self.conn, label)?.into_iter().collect())
    }

    /// Load a single node.
    pub fn node(&self, id: GateId) -> Result<Option<GateNode>, StoreError> {
        read_node(&self.conn, id)
    }

    /// Load the nodes with the given ids, skipping ids that are not present.
    pub fn load_nodes(
        &self,
        ids: impl IntoIterator<Item = GateId>,
    ) -> Result<Vec<GateNode>, StoreError> {
        ids.into_iter()
            .filter_map(|id| read_node(&self.conn, id).transpose())
            .collect()
    }

    /// Load up to `limit` nodes of a label with ids from `start` on, in id
    /// order.
    pub fn nodes_from(
        &self,
        label: Label,
        start: GateId,
        limit: usize,
    ) -> Result<Vec<GateNode>, StoreError> {
        read_block(&self.conn, label, start, limit)
    }

    /// Number of rows with the given label, sentinels included.
    pub fn count_nodes(&self, label: Label) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT count(*) FROM linked_circuit WHERE label = ?1",
            params![label],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Number of non-sentinel rows with the given label.
    pub fn count_operations(&self, label: Label) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT count(*) FROM linked_circuit WHERE label = ?1 AND gate_code NOT IN (?2, ?3)",
            params![label, GateCode::In.tag(), GateCode::Out.tag()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Delete every row with the given label, along with its edge list.
    pub fn delete_label(&mut self, label: Label) -> Result<usize, StoreError> {
        let tx = self.immediate_transaction()?;
        let n = tx.execute("DELETE FROM linked_circuit WHERE label = ?1", params![label])?;
        tx.execute("DELETE FROM edge_list WHERE label = ?1", params![label])?;
        tx.commit()?;
        Ok(n)
    }

    /// Whether a stop has been requested.
    pub fn stop_requested(&self) -> Result<bool, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT stop FROM stop_condition WHERE id = 0", [], |row| {
                row.get(0)
            })?)
    }

    /// Ask every worker polling this database to stop.
    pub fn request_stop(&self) -> Result<(), StoreError> {
        self.set_stop(true)
    }

    /// Clear the stop flag.
    pub fn reset_stop(&self) -> Result<(), StoreError> {
        self.set_stop(false)
    }

    fn set_stop(&self, stop: bool) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE stop_condition SET stop = ?1 WHERE id = 0",
            params![stop],
        )?;
        Ok(())
    }

    /// The next id the sequence will hand out.
    pub fn next_id(&self) -> Result<i64, StoreError> {
        read_next_id(&self.conn)
    }

    /// Reserve `n` consecutive ids.
    pub fn allocate_ids(&mut self, n: usize) -> Result<Range<i64>, StoreError> {
        let tx = self.immediate_transaction()?;
        let start = read_next_id(&tx)?;
        let end = start + n as i64;
        tx.execute("UPDATE id_sequence SET next_id = ?1 WHERE id = 0", params![end])?;
        tx.commit()?;
        Ok(start..end)
    }

    /// Raise the id sequence to at least `watermark`, and past every id in
    /// use. Returns the resulting next id.
    pub fn advance_id_watermark(&mut self, watermark: i64) -> Result<i64, StoreError> {
        let tx = self.immediate_transaction()?;
        let max_id: Option<i64> =
            tx.query_row("SELECT max(id) FROM linked_circuit", [], |row| row.get(0))?;
        raise_watermark(&tx, watermark.max(max_id.map_or(0, |m| m + 1)))?;
        let next = read_next_id(&tx)?;
        tx.commit()?;
        Ok(next)
    }

    /// Recompute the edge list of a label from the `next` links.
    ///
    /// Every pair of operations joined by at least one wire gives one edge,
    /// ordered by source then target id. Links to or from sentinels are left
    /// out. Returns the number of edges.
    pub fn rebuild_edge_list(&mut self, label: Label) -> Result<usize, StoreError> {
        let tx = self.immediate_transaction()?;
        tx.execute("DELETE FROM edge_list WHERE label = ?1", params![label])?;
        let n = tx.execute(
            "INSERT INTO edge_list (source_id, target_id, label)
             SELECT DISTINCT n.id, m.id, n.label
             FROM linked_circuit n
             JOIN linked_circuit m
               ON m.id IN (n.next_q1 / 10, n.next_q2 / 10, n.next_q3 / 10)
             WHERE n.label = ?1
               AND n.gate_code NOT IN (?2, ?3)
               AND m.gate_code NOT IN (?2, ?3)
             ORDER BY n.id, m.id",
            params![label, GateCode::In.tag(), GateCode::Out.tag()],
        )?;
        tx.commit()?;
        Ok(n)
    }

    /// Read up to `limit` edges of a label stored after position `after`.
    ///
    /// Pass the `seq` of the last edge returned to read the next chunk.
    pub fn read_edges(
        &self,
        label: Label,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Edge>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT seq, source_id, target_id FROM edge_list
             WHERE label = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
        )?;
        let edges = stmt
            .query_map(params![label, after, limit as i64], |row| {
                Ok(Edge {
                    seq: row.get(0)?,
                    source: GateId::new(row.get(1)?),
                    target: GateId::new(row.get(2)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }
}

/// Insert node rows on an open connection or transaction, and move the id
/// sequence past the largest inserted id. Returns the number of rows.
pub(crate) fn insert_rows<'a>(
    conn: &Connection,
    nodes: impl IntoIterator<Item = &'a GateNode>,
) -> Result<usize, StoreError> {
    let mut count = 0;
    let mut max_id = None;
    for node in nodes {
        schema::insert_node(conn, node)?;
        max_id = max_id.max(Some(node.id.index()));
        count += 1;
    }
    if let Some(max_id) = max_id {
        raise_watermark(conn, max_id + 1)?;
    }
    Ok(count)
}

pub(crate) fn read_next_id(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("SELECT next_id FROM id_sequence WHERE id = 0", [], |row| {
        row.get(0)
    })?)
}

pub(crate) fn raise_watermark(conn: &Connection, watermark: i64) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE id_sequence SET next_id = max(next_id, ?1) WHERE id = 0",
        params![watermark],
    )?;
    Ok(())
}

/// Errors from the graph store.
#[derive(Debug, Display, From, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The database rejected a statement.
    #[display("SQLite error: {_0}")]
    Sqlite(rusqlite::Error),
    /// A row could not be decoded into a node.
    #[display("Row {id} is corrupt: {reason}")]
    #[from(ignore)]
    CorruptRow {
        /// The row id.
        id: GateId,
        /// What could not be decoded.
        reason: String,
    },
    /// A node carries a link with no integer encoding.
    #[display("Cannot store link: {_0}")]
    InvalidLink(LinkError),
    /// An update targeted a row that does not exist.
    #[display("Node {id} is not in the store.")]
    #[from(ignore)]
    MissingNode {
        /// The missing id.
        id: GateId,
    },
}
