//! Database schema definitions.
//!
//! Every mirrored table is keyed by the remote external key (UNIQUE) with a
//! surrogate integer `id` that never leaves the storage layer. Parts and
//! features are keyed by their element plus their own id.

use rusqlite::{Connection, Result};

/// Current schema version for migration tracking.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The complete SQL schema for the mirror database.
///
/// Timestamps are stored as INTEGER (Unix milliseconds).
pub const SCHEMA_SQL: &str = r"
-- ====================
-- Schema Version Tracking
-- ====================

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- ====================
-- Mirrored Entities
-- ====================

CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL DEFAULT '',
    description TEXT,
    owner_id TEXT,
    owner_name TEXT,
    public INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_name ON documents(name);

CREATE TABLE IF NOT EXISTS workspaces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id TEXT NOT NULL UNIQUE,
    document_id TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    description TEXT,
    is_main INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workspaces_document ON workspaces(document_id);
CREATE INDEX IF NOT EXISTS idx_workspaces_main ON workspaces(document_id, is_main);

-- Elements remember the workspace they were last observed in
CREATE TABLE IF NOT EXISTS elements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    element_id TEXT NOT NULL UNIQUE,
    document_id TEXT NOT NULL,
    workspace_id TEXT,
    name TEXT NOT NULL DEFAULT '',
    element_type TEXT,
    data_type TEXT,
    thumbnail_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_elements_document ON elements(document_id);
CREATE INDEX IF NOT EXISTS idx_elements_type ON elements(element_type);
CREATE INDEX IF NOT EXISTS idx_elements_workspace ON elements(workspace_id);

-- Part and feature ids are only unique within their part studio.
-- JSON columns are stored as TEXT
CREATE TABLE IF NOT EXISTS parts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    part_id TEXT NOT NULL,
    element_id TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    state TEXT,
    body_type TEXT,
    material_properties TEXT,
    mass_properties TEXT,
    appearance TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (element_id, part_id)
);

CREATE INDEX IF NOT EXISTS idx_parts_element ON parts(element_id);

CREATE TABLE IF NOT EXISTS features (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    feature_id TEXT NOT NULL,
    element_id TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    feature_type TEXT,
    suppressed INTEGER NOT NULL DEFAULT 0,
    parameters TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (element_id, feature_id)
);

CREATE INDEX IF NOT EXISTS idx_features_element ON features(element_id);
CREATE INDEX IF NOT EXISTS idx_features_type ON features(feature_type);

-- ====================
-- Sync Jobs
-- ====================

CREATE TABLE IF NOT EXISTS sync_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER REFERENCES sync_jobs(id),
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'in_progress'
        CHECK (status IN ('in_progress', 'success', 'error')),
    records_processed INTEGER NOT NULL DEFAULT 0,
    errors_count INTEGER NOT NULL DEFAULT 0,
    message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    -- Process that opened the job and the last time it was seen alive
    owner TEXT,
    heartbeat_at INTEGER,
    started_at INTEGER NOT NULL,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sync_jobs_started ON sync_jobs(started_at DESC);
CREATE INDEX IF NOT EXISTS idx_sync_jobs_status ON sync_jobs(status);
CREATE INDEX IF NOT EXISTS idx_sync_jobs_parent ON sync_jobs(parent_id);
";

/// Apply the schema to the database.
///
/// Idempotent: all statements use `IF NOT EXISTS`.
///
/// # Errors
///
/// Returns an error if the SQL execution fails or pragmas cannot be set.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;

    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![
            format!("v{CURRENT_SCHEMA_VERSION}"),
            chrono::Utc::now().timestamp_millis()
        ],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_schema() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("Failed to apply schema");

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in ["documents", "workspaces", "elements", "parts", "features", "sync_jobs"] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("First apply failed");
        apply_schema(&conn).expect("Second apply failed");
    }

    #[test]
    fn test_external_key_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO documents (document_id, name, created_at, updated_at) VALUES ('d1', 'A', 0, 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO documents (document_id, name, created_at, updated_at) VALUES ('d1', 'B', 0, 0)",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_job_status_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        let ok = conn.execute(
            "INSERT INTO sync_jobs (kind, status, started_at) VALUES ('documents', 'success', 0)",
            [],
        );
        assert!(ok.is_ok());

        let bad = conn.execute(
            "INSERT INTO sync_jobs (kind, status, started_at) VALUES ('documents', 'paused', 0)",
            [],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_records_schema_version() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        apply_schema(&conn).unwrap();

        let versions: Vec<String> = conn
            .prepare("SELECT version FROM schema_migrations")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(versions, vec![format!("v{CURRENT_SCHEMA_VERSION}")]);
    }
}
