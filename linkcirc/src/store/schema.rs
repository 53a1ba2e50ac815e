//! Table layout and row conversion for the gate graph.
//!
//! The free functions here take a plain [`Connection`] so that they can run
//! either directly or inside a [`rusqlite::Transaction`], which derefs to one.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::StoreError;
use crate::circuit::{GateNode, Label};
use crate::link::{GateId, Link, LinkError, MAX_PORTS};
use crate::ops::GateCode;

/// Statements creating every table the store uses.
pub(super) const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS linked_circuit (
        id INTEGER PRIMARY KEY,
        prev_q1 INTEGER,
        prev_q2 INTEGER,
        prev_q3 INTEGER,
        gate_code INTEGER NOT NULL,
        parameter REAL NOT NULL DEFAULT 0,
        global_shift REAL NOT NULL DEFAULT 0,
        switch INTEGER NOT NULL DEFAULT 0,
        next_q1 INTEGER,
        next_q2 INTEGER,
        next_q3 INTEGER,
        visited INTEGER NOT NULL DEFAULT 0,
        label INTEGER NOT NULL,
        classically_controlled INTEGER NOT NULL DEFAULT 0,
        measurement_key TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_linked_circuit_label ON linked_circuit(label);

    CREATE TABLE IF NOT EXISTS stop_condition (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        stop INTEGER NOT NULL
    );
    INSERT OR IGNORE INTO stop_condition (id, stop) VALUES (0, 0);

    CREATE TABLE IF NOT EXISTS id_sequence (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        next_id INTEGER NOT NULL
    );
    INSERT OR IGNORE INTO id_sequence (id, next_id) VALUES (0, 0);

    CREATE TABLE IF NOT EXISTS edge_list (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id INTEGER NOT NULL,
        target_id INTEGER NOT NULL,
        label INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_edge_list_label ON edge_list(label, seq);
";

const NODE_COLUMNS: &str = "id, prev_q1, prev_q2, prev_q3, gate_code, parameter, global_shift, \
     switch, next_q1, next_q2, next_q3, visited, label, classically_controlled, measurement_key";

/// A gate table row, before the links and gate code are validated.
struct RawNode {
    id: i64,
    prev: [Option<i64>; MAX_PORTS],
    gate_code: i64,
    parameter: f64,
    global_shift: f64,
    switch: bool,
    next: [Option<i64>; MAX_PORTS],
    visited: bool,
    label: Label,
    classically_controlled: bool,
    measurement_key: Option<String>,
}

impl RawNode {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            prev: [row.get(1)?, row.get(2)?, row.get(3)?],
            gate_code: row.get(4)?,
            parameter: row.get(5)?,
            global_shift: row.get(6)?,
            switch: row.get(7)?,
            next: [row.get(8)?, row.get(9)?, row.get(10)?],
            visited: row.get(11)?,
            label: row.get(12)?,
            classically_controlled: row.get(13)?,
            measurement_key: row.get(14)?,
        })
    }
}

impl TryFrom<RawNode> for GateNode {
    type Error = StoreError;

    fn try_from(raw: RawNode) -> Result<Self, StoreError> {
        let id = GateId::new(raw.id);
        let corrupt = |reason: String| StoreError::CorruptRow { id, reason };
        let code = u8::try_from(raw.gate_code)
            .map_err(|_| corrupt(format!("gate code {} out of range", raw.gate_code)))
            .and_then(|tag| GateCode::from_tag(tag).map_err(|e| corrupt(e.to_string())))?;
        let decode = |links: [Option<i64>; MAX_PORTS]| {
            let mut out = [None; MAX_PORTS];
            for (slot, value) in out.iter_mut().zip(links) {
                *slot = value
                    .map(Link::decode)
                    .transpose()
                    .map_err(|e| corrupt(e.to_string()))?;
            }
            Ok::<_, StoreError>(out)
        };
        Ok(GateNode {
            id,
            code,
            parameter: raw.parameter,
            global_shift: raw.global_shift,
            switch: raw.switch,
            prev: decode(raw.prev)?,
            next: decode(raw.next)?,
            visited: raw.visited,
            label: raw.label,
            classically_controlled: raw.classically_controlled,
            measurement_key: raw.measurement_key,
        })
    }
}

fn encode_links(
    links: &[Option<Link>; MAX_PORTS],
) -> Result<[Option<i64>; MAX_PORTS], LinkError> {
    let [a, b, c] = links.map(|l| l.map(Link::encode).transpose());
    Ok([a?, b?, c?])
}

/// Insert a node row. Fails if the id is taken.
pub(crate) fn insert_node(conn: &Connection, node: &GateNode) -> Result<(), StoreError> {
    let prev = encode_links(&node.prev)?;
    let next = encode_links(&node.next)?;
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO linked_circuit ({NODE_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
    ))?;
    stmt.execute(params![
        node.id.index(),
        prev[0],
        prev[1],
        prev[2],
        node.code.tag(),
        node.parameter,
        node.global_shift,
        node.switch,
        next[0],
        next[1],
        next[2],
        node.visited,
        node.label,
        node.classically_controlled,
        node.measurement_key,
    ])?;
    Ok(())
}

/// Read a single node row.
pub(crate) fn read_node(conn: &Connection, id: GateId) -> Result<Option<GateNode>, StoreError> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {NODE_COLUMNS} FROM linked_circuit WHERE id = ?1"))?;
    let raw = stmt
        .query_row(params![id.index()], RawNode::from_row)
        .optional()?;
    raw.map(GateNode::try_from).transpose()
}

/// Read every row with the given label, in id order.
pub(crate) fn read_label(conn: &Connection, label: Label) -> Result<Vec<GateNode>, StoreError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {NODE_COLUMNS} FROM linked_circuit WHERE label = ?1 ORDER BY id"
    ))?;
    let raws = stmt
        .query_map(params![label], RawNode::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(GateNode::try_from).collect()
}

/// Read up to `limit` rows with ids in `[start, ..)`, in id order.
pub(crate) fn read_block(
    conn: &Connection,
    label: Label,
    start: GateId,
    limit: usize,
) -> Result<Vec<GateNode>, StoreError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {NODE_COLUMNS} FROM linked_circuit
         WHERE label = ?1 AND id >= ?2 ORDER BY id LIMIT ?3"
    ))?;
    let raws = stmt
        .query_map(params![label, start.index(), limit as i64], RawNode::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(GateNode::try_from).collect()
}

/// Read each row independently kept with probability `percent / 100`.
pub(crate) fn read_bernoulli(
    conn: &Connection,
    label: Label,
    percent: f64,
) -> Result<Vec<GateNode>, StoreError> {
    let threshold = (percent.clamp(0.0, 100.0) * 100.0).round() as i64;
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {NODE_COLUMNS} FROM linked_circuit
         WHERE label = ?1 AND abs(random() % 10000) < ?2"
    ))?;
    let raws = stmt
        .query_map(params![label, threshold], RawNode::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(GateNode::try_from).collect()
}

/// Overwrite the links and scratch flag of an existing row.
pub(crate) fn write_links(conn: &Connection, node: &GateNode) -> Result<(), StoreError> {
    let prev = encode_links(&node.prev)?;
    let next = encode_links(&node.next)?;
    let mut stmt = conn.prepare_cached(
        "UPDATE linked_circuit
         SET prev_q1 = ?2, prev_q2 = ?3, prev_q3 = ?4,
             next_q1 = ?5, next_q2 = ?6, next_q3 = ?7, visited = ?8
         WHERE id = ?1",
    )?;
    let changed = stmt.execute(params![
        node.id.index(),
        prev[0],
        prev[1],
        prev[2],
        next[0],
        next[1],
        next[2],
        node.visited,
    ])?;
    match changed {
        0 => Err(StoreError::MissingNode { id: node.id }),
        _ => Ok(()),
    }
}

/// Delete a row. Returns whether it existed.
pub(crate) fn delete_node(conn: &Connection, id: GateId) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare_cached("DELETE FROM linked_circuit WHERE id = ?1")?;
    Ok(stmt.execute(params![id.index()])? > 0)
}
