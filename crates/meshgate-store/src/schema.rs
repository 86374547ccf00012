//! Relational schema — `nodes`, `positions`, `telemetry`, `messages`,
//! `channels`, `traceroutes`, `metadata` — applied as one batch of DDL at
//! startup, with PRAGMA setup on connection open.
//!
//! Schema version is a hard-coded Rust constant checked against
//! `metadata.schema_version`, the same "good enough for this daemon"
//! posture as the teacher's `KnownSchema`: a production system might load
//! schema dynamically, this one doesn't need to.

use rusqlite::Connection;
use thiserror::Error;

pub const CURRENT_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("schema version mismatch: database has {found}, expected {expected}")]
    VersionMismatch { found: i64, expected: i64 },
}

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    node_num INTEGER UNIQUE NOT NULL,
    short_name TEXT,
    long_name TEXT,
    hw_model TEXT,
    role TEXT,
    last_heard INTEGER NOT NULL,
    snr REAL,
    rssi INTEGER,
    hops_away INTEGER,
    battery_level INTEGER,
    voltage REAL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    node_num INTEGER NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    altitude INTEGER,
    precision_bits INTEGER,
    timestamp INTEGER NOT NULL,
    snr REAL,
    rssi INTEGER
);

CREATE TABLE IF NOT EXISTS telemetry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    node_num INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    battery_level INTEGER,
    voltage REAL,
    channel_utilization REAL,
    air_util_tx REAL,
    uptime_seconds INTEGER,
    temperature REAL,
    snr REAL,
    rssi INTEGER
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    from_id TEXT NOT NULL REFERENCES nodes(id),
    to_id TEXT NOT NULL,
    channel INTEGER NOT NULL,
    text TEXT,
    timestamp INTEGER NOT NULL,
    snr REAL,
    rssi INTEGER,
    hops_away INTEGER,
    reply_to INTEGER REFERENCES messages(id) ON DELETE SET NULL,
    read_at INTEGER
);

CREATE TABLE IF NOT EXISTS channels (
    id INTEGER PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    role TEXT NOT NULL,
    has_key INTEGER NOT NULL,
    last_seen INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS traceroutes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    to_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    timestamp INTEGER NOT NULL,
    route TEXT NOT NULL,
    route_back TEXT,
    snr_towards TEXT,
    snr_back TEXT,
    hops INTEGER NOT NULL,
    success INTEGER NOT NULL,
    latency_ms INTEGER
);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nodes_last_heard ON nodes(last_heard DESC);
CREATE INDEX IF NOT EXISTS idx_nodes_updated_at ON nodes(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_positions_node_ts ON positions(node_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_positions_ts ON positions(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_positions_latlon ON positions(latitude, longitude);
CREATE INDEX IF NOT EXISTS idx_telemetry_node_ts ON telemetry(node_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_telemetry_ts ON telemetry(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_messages_from_ts ON messages(from_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_messages_to_ts ON messages(to_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_messages_channel_ts ON messages(channel, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_traceroutes_ts ON traceroutes(timestamp DESC);
"#;

/// Open a connection with the PRAGMAs the spec requires, then apply (or
/// verify) the schema.
pub fn open(path: &str) -> Result<Connection, SchemaError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA cache_size = -65536;",
    )?;
    apply_or_verify(&conn)?;
    Ok(conn)
}

fn apply_or_verify(conn: &Connection) -> Result<(), SchemaError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(CREATE_TABLES)?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .ok();

    match existing {
        None => {
            tx.execute(
                "INSERT INTO metadata (key, value) VALUES ('schema_version', ?1)",
                [CURRENT_SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) => {
            let found: i64 = v.parse().unwrap_or(-1);
            if found != CURRENT_SCHEMA_VERSION {
                return Err(SchemaError::VersionMismatch {
                    found,
                    expected: CURRENT_SCHEMA_VERSION,
                });
            }
        }
    }

    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_gets_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        apply_or_verify(&conn).unwrap();
        let v: String = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(v.parse::<i64>().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn reapplying_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_or_verify(&conn).unwrap();
        apply_or_verify(&conn).unwrap();
    }

    #[test]
    fn mismatched_version_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        apply_or_verify(&conn).unwrap();
        conn.execute(
            "UPDATE metadata SET value = '999' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();
        assert!(matches!(
            apply_or_verify(&conn),
            Err(SchemaError::VersionMismatch { found: 999, .. })
        ));
    }

    #[test]
    fn foreign_key_cascade_deletes_positions() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        apply_or_verify(&conn).unwrap();
        conn.execute(
            "INSERT INTO nodes (id, node_num, last_heard, created_at, updated_at) VALUES ('!1', 1, 0, 0, 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO positions (node_id, node_num, latitude, longitude, timestamp) VALUES ('!1', 1, 1.0, 2.0, 0)",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM nodes WHERE id = '!1'", []).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM positions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
