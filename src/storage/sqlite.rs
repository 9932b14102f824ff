//! SQLite storage implementation.
//!
//! This module provides the storage backend for the mirror. Writes from the
//! sync engine go through [`SqliteStorage::batch`], which wraps one IMMEDIATE
//! transaction; the per-entity `upsert_*` functions run inside it against
//! whatever connection (transaction or savepoint) they are handed.

use crate::error::{Error, Result};
use crate::model::{JobKind, JobStatus, SyncJob};
use crate::remote::BestEffort;
use crate::remote::types::{
    RemoteDocument, RemoteElement, RemoteFeature, RemotePart, RemoteWorkspace,
};
use crate::storage::schema::apply_schema;
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// SQLite-based storage backend.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
}

/// Whether an upsert inserted a new row or overwrote an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Created,
    Updated,
}

/// Filters for listing sync jobs.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    /// Only children of this job
    pub parent: Option<i64>,
    /// Only jobs without a parent
    pub roots_only: bool,
    pub limit: u32,
    pub offset: u32,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            kind: None,
            status: None,
            parent: None,
            roots_only: false,
            limit: 50,
            offset: 0,
        }
    }
}

impl SqliteStorage {
    /// Open a database at the given path.
    ///
    /// Creates the database and applies schema if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a database with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Default 5 second timeout
        conn.busy_timeout(timeout_ms.map_or(Duration::from_secs(5), Duration::from_millis))?;

        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Run `f` inside one IMMEDIATE transaction and commit once.
    ///
    /// The closure gets the transaction mutably so it can open savepoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot begin or commit, or if `f`
    /// fails (the transaction is rolled back).
    pub fn batch<F, R>(&mut self, op: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction) -> Result<R>,
    {
        let mut tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let result = f(&mut tx)?;

        tx.commit()?;
        tracing::trace!(op, "Committed batch");

        Ok(result)
    }

    // ==================
    // Document Operations
    // ==================

    /// Get a document by external key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        self.conn
            .query_row(
                "SELECT document_id, name, description, owner_id, owner_name, public, created_at, updated_at
                 FROM documents WHERE document_id = ?1",
                [document_id],
                map_document_row,
            )
            .optional()
            .map_err(Error::from)
    }

    /// Whether a document is already mirrored.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn document_exists(&self, document_id: &str) -> Result<bool> {
        self.conn
            .prepare_cached("SELECT 1 FROM documents WHERE document_id = ?1")?
            .exists([document_id])
            .map_err(Error::from)
    }

    /// List mirrored documents in first-mirrored order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_documents(&self, limit: u32, offset: u32) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(
            "SELECT document_id, name, description, owner_id, owner_name, public, created_at, updated_at
             FROM documents ORDER BY id ASC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit, offset], map_document_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// External keys of the first `limit` mirrored documents.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn document_ids(&self, limit: usize) -> Result<Vec<String>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self
            .conn
            .prepare("SELECT document_id FROM documents ORDER BY id ASC LIMIT ?1")?;
        let rows = stmt.query_map([limit], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // ==================
    // Workspace Operations
    // ==================

    /// Get a workspace by external key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>> {
        self.conn
            .query_row(
                "SELECT workspace_id, document_id, name, description, is_main, created_at, updated_at
                 FROM workspaces WHERE workspace_id = ?1",
                [workspace_id],
                map_workspace_row,
            )
            .optional()
            .map_err(Error::from)
    }

    /// List workspaces, optionally scoped to one document.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_workspaces(
        &self,
        document_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Workspace>> {
        let mut sql = String::from(
            "SELECT workspace_id, document_id, name, description, is_main, created_at, updated_at
             FROM workspaces WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(did) = document_id {
            sql.push_str(" AND document_id = ?");
            params.push(Box::new(did.to_string()));
        }

        sql.push_str(" ORDER BY document_id ASC, name ASC LIMIT ? OFFSET ?");
        params.push(Box::new(limit));
        params.push(Box::new(offset));

        self.query_list(&sql, &params, map_workspace_row)
    }

    /// The main workspace of a document.
    ///
    /// At most one flagged workspace is expected but not enforced; if several
    /// are flagged the most recently updated wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn main_workspace(&self, document_id: &str) -> Result<Option<Workspace>> {
        self.conn
            .query_row(
                "SELECT workspace_id, document_id, name, description, is_main, created_at, updated_at
                 FROM workspaces WHERE document_id = ?1 AND is_main = 1
                 ORDER BY updated_at DESC, id DESC LIMIT 1",
                [document_id],
                map_workspace_row,
            )
            .optional()
            .map_err(Error::from)
    }

    /// The first workspace of a document by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn first_workspace(&self, document_id: &str) -> Result<Option<Workspace>> {
        self.conn
            .query_row(
                "SELECT workspace_id, document_id, name, description, is_main, created_at, updated_at
                 FROM workspaces WHERE document_id = ?1
                 ORDER BY name ASC, id ASC LIMIT 1",
                [document_id],
                map_workspace_row,
            )
            .optional()
            .map_err(Error::from)
    }

    // ==================
    // Element Operations
    // ==================

    /// Get an element by external key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_element(&self, element_id: &str) -> Result<Option<Element>> {
        self.conn
            .query_row(
                "SELECT element_id, document_id, workspace_id, name, element_type, data_type, thumbnail_id, created_at, updated_at
                 FROM elements WHERE element_id = ?1",
                [element_id],
                map_element_row,
            )
            .optional()
            .map_err(Error::from)
    }

    /// List elements with optional document, workspace and type filters.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_elements(
        &self,
        document_id: Option<&str>,
        workspace_id: Option<&str>,
        element_type: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Element>> {
        let mut sql = String::from(
            "SELECT element_id, document_id, workspace_id, name, element_type, data_type, thumbnail_id, created_at, updated_at
             FROM elements WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(did) = document_id {
            sql.push_str(" AND document_id = ?");
            params.push(Box::new(did.to_string()));
        }
        if let Some(wid) = workspace_id {
            sql.push_str(" AND workspace_id = ?");
            params.push(Box::new(wid.to_string()));
        }
        if let Some(t) = element_type {
            sql.push_str(" AND element_type = ?");
            params.push(Box::new(t.to_string()));
        }

        sql.push_str(" ORDER BY id ASC LIMIT ? OFFSET ?");
        params.push(Box::new(limit));
        params.push(Box::new(offset));

        self.query_list(&sql, &params, map_element_row)
    }

    // ==================
    // Part Operations
    // ==================

    /// Get a part by id, within `element_id` when given.
    ///
    /// Part ids repeat across part studios; without an element the most
    /// recently updated match is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_part(&self, part_id: &str, element_id: Option<&str>) -> Result<Option<Part>> {
        self.conn
            .query_row(
                "SELECT part_id, element_id, name, state, body_type, material_properties, mass_properties, appearance, created_at, updated_at
                 FROM parts WHERE part_id = ?1 AND (?2 IS NULL OR element_id = ?2)
                 ORDER BY updated_at DESC, id DESC LIMIT 1",
                rusqlite::params![part_id, element_id],
                map_part_row,
            )
            .optional()
            .map_err(Error::from)
    }

    /// List parts, optionally scoped to one element.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_parts(&self, element_id: Option<&str>, limit: u32, offset: u32) -> Result<Vec<Part>> {
        let mut sql = String::from(
            "SELECT part_id, element_id, name, state, body_type, material_properties, mass_properties, appearance, created_at, updated_at
             FROM parts WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(eid) = element_id {
            sql.push_str(" AND element_id = ?");
            params.push(Box::new(eid.to_string()));
        }

        sql.push_str(" ORDER BY id ASC LIMIT ? OFFSET ?");
        params.push(Box::new(limit));
        params.push(Box::new(offset));

        self.query_list(&sql, &params, map_part_row)
    }

    // ==================
    // Feature Operations
    // ==================

    /// Get a feature by id, within `element_id` when given.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_feature(&self, feature_id: &str, element_id: Option<&str>) -> Result<Option<Feature>> {
        self.conn
            .query_row(
                "SELECT feature_id, element_id, name, feature_type, suppressed, parameters, created_at, updated_at
                 FROM features WHERE feature_id = ?1 AND (?2 IS NULL OR element_id = ?2)
                 ORDER BY updated_at DESC, id DESC LIMIT 1",
                rusqlite::params![feature_id, element_id],
                map_feature_row,
            )
            .optional()
            .map_err(Error::from)
    }

    /// List features with optional element and type filters.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_features(
        &self,
        element_id: Option<&str>,
        feature_type: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Feature>> {
        let mut sql = String::from(
            "SELECT feature_id, element_id, name, feature_type, suppressed, parameters, created_at, updated_at
             FROM features WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(eid) = element_id {
            sql.push_str(" AND element_id = ?");
            params.push(Box::new(eid.to_string()));
        }
        if let Some(t) = feature_type {
            sql.push_str(" AND feature_type = ?");
            params.push(Box::new(t.to_string()));
        }

        sql.push_str(" ORDER BY id ASC LIMIT ? OFFSET ?");
        params.push(Box::new(limit));
        params.push(Box::new(offset));

        self.query_list(&sql, &params, map_feature_row)
    }

    // ==================
    // Sync Job Operations
    // ==================

    /// Insert an `in_progress` job owned by `owner` and return its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn create_job(
        &mut self,
        kind: JobKind,
        parent_id: Option<i64>,
        message: Option<&str>,
        metadata: &Value,
        owner: &str,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "INSERT INTO sync_jobs (parent_id, kind, status, message, metadata, owner, heartbeat_at, started_at)
             VALUES (?1, ?2, 'in_progress', ?3, ?4, ?5, ?6, ?6)",
            rusqlite::params![parent_id, kind.as_str(), message, metadata.to_string(), owner, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Stamp `heartbeat_at` on every open job of `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn touch_jobs(&mut self, owner: &str, now: i64) -> Result<usize> {
        let touched = self.conn.execute(
            "UPDATE sync_jobs SET heartbeat_at = ?2
             WHERE owner = ?1 AND status = 'in_progress'",
            rusqlite::params![owner, now],
        )?;
        Ok(touched)
    }

    /// Move an `in_progress` job to a terminal status.
    ///
    /// Returns `false` without writing if the job was already closed.
    /// `metadata`, when given, replaces the stored metadata.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for a non-terminal status, or a
    /// database error.
    pub fn close_job(
        &mut self,
        id: i64,
        status: JobStatus,
        records_processed: u64,
        errors_count: u64,
        message: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::InvalidArgument(format!(
                "cannot close job {id} as {}",
                status.as_str()
            )));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let processed = i64::try_from(records_processed).unwrap_or(i64::MAX);
        let errors = i64::try_from(errors_count).unwrap_or(i64::MAX);
        let changed = self.conn.execute(
            "UPDATE sync_jobs
             SET status = ?2, records_processed = ?3, errors_count = ?4,
                 message = COALESCE(?5, message),
                 metadata = COALESCE(?6, metadata),
                 completed_at = ?7
             WHERE id = ?1 AND status = 'in_progress'",
            rusqlite::params![
                id,
                status.as_str(),
                processed,
                errors,
                message,
                metadata.map(Value::to_string),
                now
            ],
        )?;

        Ok(changed == 1)
    }

    /// Get a job by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_job(&self, id: i64) -> Result<Option<SyncJob>> {
        self.conn
            .query_row(
                "SELECT id, parent_id, kind, status, records_processed, errors_count, message, started_at, completed_at, metadata
                 FROM sync_jobs WHERE id = ?1",
                [id],
                map_job_row,
            )
            .optional()
            .map_err(Error::from)
    }

    /// List jobs newest-first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<SyncJob>> {
        let mut sql = String::from(
            "SELECT id, parent_id, kind, status, records_processed, errors_count, message, started_at, completed_at, metadata
             FROM sync_jobs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(kind) = filter.kind {
            sql.push_str(" AND kind = ?");
            params.push(Box::new(kind.as_str()));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            params.push(Box::new(status.as_str()));
        }
        if let Some(parent) = filter.parent {
            sql.push_str(" AND parent_id = ?");
            params.push(Box::new(parent));
        } else if filter.roots_only {
            sql.push_str(" AND parent_id IS NULL");
        }

        sql.push_str(" ORDER BY started_at DESC, id DESC LIMIT ? OFFSET ?");
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        self.query_list(&sql, &params, map_job_row)
    }

    /// Jobs opened under `parent_id`, in the order they ran.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn job_children(&self, parent_id: i64) -> Result<Vec<SyncJob>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, parent_id, kind, status, records_processed, errors_count, message, started_at, completed_at, metadata
             FROM sync_jobs WHERE parent_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([parent_id], map_job_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Close `in_progress` jobs of other owners whose last heartbeat is at
    /// or before `stale_at`, as `error` with `message`.
    ///
    /// Jobs owned by `owner` are never touched. Returns how many were closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn close_abandoned_jobs(&mut self, message: &str, owner: &str, stale_at: i64) -> Result<usize> {
        let now = chrono::Utc::now().timestamp_millis();
        let closed = self.conn.execute(
            "UPDATE sync_jobs SET status = 'error', errors_count = errors_count + 1,
                 message = ?1, completed_at = ?2
             WHERE status = 'in_progress'
               AND (owner IS NULL OR owner != ?3)
               AND COALESCE(heartbeat_at, started_at) <= ?4",
            rusqlite::params![message, now, owner, stale_at],
        )?;
        Ok(closed)
    }

    // ==================
    // Statistics
    // ==================

    /// Row counts per table plus the five most recent jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub fn stats(&self) -> Result<MirrorStats> {
        let count = |table: &str| -> Result<i64> {
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .map_err(Error::from)
        };

        Ok(MirrorStats {
            documents: count("documents")?,
            workspaces: count("workspaces")?,
            elements: count("elements")?,
            parts: count("parts")?,
            features: count("features")?,
            sync_jobs: count("sync_jobs")?,
            recent_jobs: self.list_jobs(&JobFilter {
                limit: 5,
                ..JobFilter::default()
            })?,
        })
    }

    fn query_list<T>(
        &self,
        sql: &str,
        params: &[Box<dyn rusqlite::ToSql>],
        map: fn(&rusqlite::Row) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
        let rows = stmt.query_map(params_refs.as_slice(), map)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }
}

// ==================
// Shared Handle
// ==================

/// One connection shared by every sync task.
///
/// All writes serialise on the mutex, so two reconciliations can never race
/// on the same external key. Never hold the guard across an `.await`.
#[derive(Debug, Clone)]
pub struct SharedStorage {
    inner: Arc<Mutex<SqliteStorage>>,
}

impl SharedStorage {
    #[must_use]
    pub fn new(storage: SqliteStorage) -> Self {
        Self {
            inner: Arc::new(Mutex::new(storage)),
        }
    }

    /// Run `f` with exclusive access to the storage.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or `Error::Other` if a previous holder
    /// panicked.
    pub fn with<R>(&self, f: impl FnOnce(&mut SqliteStorage) -> Result<R>) -> Result<R> {
        let mut guard = self.lock()?;
        f(&mut guard)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SqliteStorage>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("storage lock poisoned".into()))
    }
}

// ==================
// Entity Writes
// ==================
//
// Each upsert looks the record up by external key, overwrites the mutable
// fields and `updated_at` if found, and inserts with parent linkage
// otherwise. Parent keys are not rewritten on update.

fn find_id(conn: &Connection, table: &str, key_column: &str, key: &str) -> rusqlite::Result<Option<i64>> {
    conn.prepare_cached(&format!("SELECT id FROM {table} WHERE {key_column} = ?1"))?
        .query_row([key], |row| row.get(0))
        .optional()
}

/// Like [`find_id`] for tables keyed within an element.
fn find_scoped_id(
    conn: &Connection,
    table: &str,
    key_column: &str,
    element_id: &str,
    key: &str,
) -> rusqlite::Result<Option<i64>> {
    conn.prepare_cached(&format!(
        "SELECT id FROM {table} WHERE element_id = ?1 AND {key_column} = ?2"
    ))?
    .query_row([element_id, key], |row| row.get(0))
    .optional()
}

/// Upsert a document.
///
/// # Errors
///
/// Returns the underlying SQLite error.
pub fn upsert_document(conn: &Connection, doc: &RemoteDocument, now: i64) -> rusqlite::Result<Upserted> {
    let owner = doc.owner.clone().unwrap_or_default();
    let name = doc.name.as_deref().unwrap_or("");
    let public = doc.public.unwrap_or(false);

    if let Some(id) = find_id(conn, "documents", "document_id", &doc.id)? {
        conn.execute(
            "UPDATE documents SET name = ?2, description = ?3, owner_id = ?4, owner_name = ?5,
                 public = ?6, updated_at = ?7
             WHERE id = ?1",
            rusqlite::params![id, name, doc.description, owner.id, owner.name, public, now],
        )?;
        Ok(Upserted::Updated)
    } else {
        conn.execute(
            "INSERT INTO documents (document_id, name, description, owner_id, owner_name, public, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            rusqlite::params![doc.id, name, doc.description, owner.id, owner.name, public, now],
        )?;
        Ok(Upserted::Created)
    }
}

/// Upsert a workspace under `document_id`.
///
/// # Errors
///
/// Returns the underlying SQLite error.
pub fn upsert_workspace(
    conn: &Connection,
    document_id: &str,
    ws: &RemoteWorkspace,
    now: i64,
) -> rusqlite::Result<Upserted> {
    let name = ws.name.as_deref().unwrap_or("");
    let is_main = ws.is_main.unwrap_or(false);

    if let Some(id) = find_id(conn, "workspaces", "workspace_id", &ws.id)? {
        conn.execute(
            "UPDATE workspaces SET name = ?2, description = ?3, is_main = ?4, updated_at = ?5
             WHERE id = ?1",
            rusqlite::params![id, name, ws.description, is_main, now],
        )?;
        Ok(Upserted::Updated)
    } else {
        conn.execute(
            "INSERT INTO workspaces (workspace_id, document_id, name, description, is_main, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            rusqlite::params![ws.id, document_id, name, ws.description, is_main, now],
        )?;
        Ok(Upserted::Created)
    }
}

/// Upsert an element under `document_id`, recording the workspace it was
/// observed in.
///
/// # Errors
///
/// Returns the underlying SQLite error.
pub fn upsert_element(
    conn: &Connection,
    document_id: &str,
    workspace_id: Option<&str>,
    el: &RemoteElement,
    now: i64,
) -> rusqlite::Result<Upserted> {
    let name = el.name.as_deref().unwrap_or("");

    if let Some(id) = find_id(conn, "elements", "element_id", &el.id)? {
        conn.execute(
            "UPDATE elements SET name = ?2, element_type = ?3, data_type = ?4, thumbnail_id = ?5,
                 workspace_id = COALESCE(?6, workspace_id), updated_at = ?7
             WHERE id = ?1",
            rusqlite::params![id, name, el.element_type, el.data_type, el.thumbnail_id, workspace_id, now],
        )?;
        Ok(Upserted::Updated)
    } else {
        conn.execute(
            "INSERT INTO elements (element_id, document_id, workspace_id, name, element_type, data_type, thumbnail_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            rusqlite::params![el.id, document_id, workspace_id, name, el.element_type, el.data_type, el.thumbnail_id, now],
        )?;
        Ok(Upserted::Created)
    }
}

/// Upsert a part under `element_id`.
///
/// Mass properties follow the sub-fetch outcome: fetched values are stored,
/// `Absent` clears the column, a failed or unattempted fetch leaves it as is.
///
/// # Errors
///
/// Returns the underlying SQLite error.
pub fn upsert_part(
    conn: &Connection,
    element_id: &str,
    part: &RemotePart,
    now: i64,
) -> rusqlite::Result<Upserted> {
    let name = part.name.as_deref().unwrap_or("");
    let material = part.material_properties.as_ref().map(Value::to_string);
    let appearance = part.appearance.as_ref().map(Value::to_string);
    let (touch_mass, mass) = match &part.mass_properties {
        Some(BestEffort::Fetched(v)) => (true, Some(v.to_string())),
        Some(BestEffort::Absent) => (true, None),
        Some(BestEffort::Failed(_)) | None => (false, None),
    };

    if let Some(id) = find_scoped_id(conn, "parts", "part_id", element_id, &part.part_id)? {
        conn.execute(
            "UPDATE parts SET name = ?2, state = ?3, body_type = ?4, material_properties = ?5,
                 appearance = ?6,
                 mass_properties = CASE WHEN ?7 THEN ?8 ELSE mass_properties END,
                 updated_at = ?9
             WHERE id = ?1",
            rusqlite::params![id, name, part.state, part.body_type, material, appearance, touch_mass, mass, now],
        )?;
        Ok(Upserted::Updated)
    } else {
        conn.execute(
            "INSERT INTO parts (part_id, element_id, name, state, body_type, material_properties, mass_properties, appearance, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            rusqlite::params![part.part_id, element_id, name, part.state, part.body_type, material, mass, appearance, now],
        )?;
        Ok(Upserted::Created)
    }
}

/// Upsert a feature under `element_id`.
///
/// # Errors
///
/// Returns the underlying SQLite error.
pub fn upsert_feature(
    conn: &Connection,
    element_id: &str,
    feature: &RemoteFeature,
    now: i64,
) -> rusqlite::Result<Upserted> {
    let name = feature.name.as_deref().unwrap_or("");
    let suppressed = feature.suppressed.unwrap_or(false);
    let parameters = feature.parameters.as_ref().map(Value::to_string);

    if let Some(id) = find_scoped_id(conn, "features", "feature_id", element_id, &feature.feature_id)? {
        conn.execute(
            "UPDATE features SET name = ?2, feature_type = ?3, suppressed = ?4, parameters = ?5, updated_at = ?6
             WHERE id = ?1",
            rusqlite::params![id, name, feature.feature_type, suppressed, parameters, now],
        )?;
        Ok(Upserted::Updated)
    } else {
        conn.execute(
            "INSERT INTO features (feature_id, element_id, name, feature_type, suppressed, parameters, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            rusqlite::params![feature.feature_id, element_id, name, feature.feature_type, suppressed, parameters, now],
        )?;
        Ok(Upserted::Created)
    }
}

// ==================
// Row Mapping
// ==================

fn json_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

fn map_document_row(row: &rusqlite::Row) -> rusqlite::Result<Document> {
    Ok(Document {
        document_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        owner_id: row.get(3)?,
        owner_name: row.get(4)?,
        public: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn map_workspace_row(row: &rusqlite::Row) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        workspace_id: row.get(0)?,
        document_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        is_main: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_element_row(row: &rusqlite::Row) -> rusqlite::Result<Element> {
    Ok(Element {
        element_id: row.get(0)?,
        document_id: row.get(1)?,
        workspace_id: row.get(2)?,
        name: row.get(3)?,
        element_type: row.get(4)?,
        data_type: row.get(5)?,
        thumbnail_id: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn map_part_row(row: &rusqlite::Row) -> rusqlite::Result<Part> {
    Ok(Part {
        part_id: row.get(0)?,
        element_id: row.get(1)?,
        name: row.get(2)?,
        state: row.get(3)?,
        body_type: row.get(4)?,
        material_properties: json_column(row, 5)?,
        mass_properties: json_column(row, 6)?,
        appearance: json_column(row, 7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn map_feature_row(row: &rusqlite::Row) -> rusqlite::Result<Feature> {
    Ok(Feature {
        feature_id: row.get(0)?,
        element_id: row.get(1)?,
        name: row.get(2)?,
        feature_type: row.get(3)?,
        suppressed: row.get(4)?,
        parameters: json_column(row, 5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn map_job_row(row: &rusqlite::Row) -> rusqlite::Result<SyncJob> {
    let status: String = row.get(3)?;
    Ok(SyncJob {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        kind: row.get(2)?,
        status: JobStatus::from_str(&status),
        records_processed: row.get(4)?,
        errors_count: row.get(5)?,
        message: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        metadata: json_column(row, 9)?.unwrap_or_else(|| Value::Object(serde_json::Map::new())),
    })
}

// ==================
// Data Structures
// ==================

/// A mirrored document.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Document {
    pub document_id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: Option<String>,
    pub owner_name: Option<String>,
    pub public: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A mirrored workspace.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Workspace {
    pub workspace_id: String,
    pub document_id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_main: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A mirrored element (tab) of a document.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Element {
    pub element_id: String,
    pub document_id: String,
    pub workspace_id: Option<String>,
    pub name: String,
    pub element_type: Option<String>,
    pub data_type: Option<String>,
    pub thumbnail_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A mirrored part of a part studio.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Part {
    pub part_id: String,
    pub element_id: String,
    pub name: String,
    pub state: Option<String>,
    pub body_type: Option<String>,
    pub material_properties: Option<Value>,
    pub mass_properties: Option<Value>,
    pub appearance: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A mirrored feature of a part studio.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Feature {
    pub feature_id: String,
    pub element_id: String,
    pub name: String,
    pub feature_type: Option<String>,
    pub suppressed: bool,
    pub parameters: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Mirror-wide counts.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MirrorStats {
    pub documents: i64,
    pub workspaces: i64,
    pub elements: i64,
    pub parts: i64,
    pub features: i64,
    pub sync_jobs: i64,
    pub recent_jobs: Vec<SyncJob>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workspace(id: &str, name: &str, is_main: bool) -> RemoteWorkspace {
        RemoteWorkspace {
            id: id.into(),
            name: Some(name.into()),
            description: None,
            is_main: Some(is_main),
        }
    }

    fn part(id: &str, mass: Option<BestEffort<Value>>) -> RemotePart {
        RemotePart {
            part_id: id.into(),
            name: Some("Bracket".into()),
            state: Some("ACTIVE".into()),
            body_type: Some("solid".into()),
            material_properties: Some(json!({"name": "Steel"})),
            appearance: None,
            mass_properties: mass,
        }
    }

    #[test]
    fn test_upsert_workspace_creates_then_updates() {
        let mut storage = SqliteStorage::open_memory().unwrap();

        let first = storage
            .batch("t", |tx| Ok(upsert_workspace(tx, "d1", &workspace("w1", "Main", true), 1)?))
            .unwrap();
        let second = storage
            .batch("t", |tx| Ok(upsert_workspace(tx, "d1", &workspace("w1", "Renamed", true), 2)?))
            .unwrap();

        assert_eq!(first, Upserted::Created);
        assert_eq!(second, Upserted::Updated);

        let ws = storage.get_workspace("w1").unwrap().unwrap();
        assert_eq!(ws.name, "Renamed");
        assert_eq!(ws.created_at, 1);
        assert_eq!(ws.updated_at, 2);
        assert_eq!(storage.list_workspaces(Some("d1"), 50, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_main_workspace_lookup() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage
            .batch("t", |tx| {
                upsert_workspace(tx, "d1", &workspace("w1", "Main", true), 1)?;
                upsert_workspace(tx, "d1", &workspace("w2", "Branch", false), 1)?;
                Ok(())
            })
            .unwrap();

        let main = storage.main_workspace("d1").unwrap().unwrap();
        assert_eq!(main.workspace_id, "w1");
        assert!(storage.main_workspace("d2").unwrap().is_none());
        assert_eq!(storage.first_workspace("d1").unwrap().unwrap().workspace_id, "w2");
    }

    #[test]
    fn test_main_workspace_prefers_most_recent_flag() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage
            .batch("t", |tx| {
                upsert_workspace(tx, "d1", &workspace("w1", "A", true), 1)?;
                upsert_workspace(tx, "d1", &workspace("w2", "B", true), 5)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(storage.main_workspace("d1").unwrap().unwrap().workspace_id, "w2");
    }

    #[test]
    fn test_mass_properties_follow_sub_fetch_outcome() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let mass = json!({"mass": [1.5]});

        storage
            .batch("t", |tx| Ok(upsert_part(tx, "e1", &part("p1", Some(BestEffort::Fetched(mass.clone()))), 1)?))
            .unwrap();
        assert_eq!(storage.get_part("p1", None).unwrap().unwrap().mass_properties, Some(mass.clone()));

        // failed fetch keeps the stored value
        storage
            .batch("t", |tx| Ok(upsert_part(tx, "e1", &part("p1", Some(BestEffort::Failed("503".into()))), 2)?))
            .unwrap();
        assert_eq!(storage.get_part("p1", None).unwrap().unwrap().mass_properties, Some(mass));

        // absent clears it
        storage
            .batch("t", |tx| Ok(upsert_part(tx, "e1", &part("p1", Some(BestEffort::Absent)), 3)?))
            .unwrap();
        let stored = storage.get_part("p1", None).unwrap().unwrap();
        assert!(stored.mass_properties.is_none());
        assert_eq!(stored.material_properties, Some(json!({"name": "Steel"})));
    }

    #[test]
    fn test_element_keeps_document_and_tracks_workspace() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let el = RemoteElement {
            id: "e1".into(),
            name: Some("Part Studio 1".into()),
            element_type: Some("PARTSTUDIO".into()),
            data_type: None,
            thumbnail_id: None,
        };

        storage
            .batch("t", |tx| {
                upsert_element(tx, "d1", Some("w1"), &el, 1)?;
                upsert_element(tx, "d-other", Some("w2"), &el, 2)?;
                Ok(())
            })
            .unwrap();

        let stored = storage.get_element("e1").unwrap().unwrap();
        assert_eq!(stored.document_id, "d1");
        assert_eq!(stored.workspace_id.as_deref(), Some("w2"));

        let studios = storage
            .list_elements(Some("d1"), Some("w2"), Some("PARTSTUDIO"), 50, 0)
            .unwrap();
        assert_eq!(studios.len(), 1);
    }

    #[test]
    fn test_batch_rolls_back_on_error() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let result: Result<()> = storage.batch("t", |tx| {
            upsert_workspace(tx, "d1", &workspace("w1", "Main", true), 1)?;
            Err(Error::Other("boom".into()))
        });

        assert!(result.is_err());
        assert!(storage.get_workspace("w1").unwrap().is_none());
    }

    #[test]
    fn test_job_lifecycle_closes_once() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let id = storage
            .create_job(JobKind::Documents, None, Some("Starting"), &json!({}), "p1")
            .unwrap();

        let job = storage.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(job.completed_at.is_none());

        assert!(storage
            .close_job(id, JobStatus::Success, 7, 1, Some("Synced 7 documents"), None)
            .unwrap());
        let first_close = storage.get_job(id).unwrap().unwrap();

        assert!(!storage
            .close_job(id, JobStatus::Error, 0, 1, Some("late"), None)
            .unwrap());
        let job = storage.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.records_processed, 7);
        assert_eq!(job.errors_count, 1);
        assert_eq!(job.message.as_deref(), Some("Synced 7 documents"));
        assert_eq!(job.completed_at, first_close.completed_at);
    }

    #[test]
    fn test_close_job_rejects_in_progress() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let id = storage.create_job(JobKind::Parts, None, None, &json!({}), "p1").unwrap();
        let err = storage
            .close_job(id, JobStatus::InProgress, 0, 0, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_list_jobs_filters_and_orders() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let root = storage.create_job(JobKind::FullSync, None, None, &json!({}), "p1").unwrap();
        let child_a = storage.create_job(JobKind::Documents, Some(root), None, &json!({}), "p1").unwrap();
        let child_b = storage.create_job(JobKind::Workspaces, Some(root), None, &json!({}), "p1").unwrap();
        storage.close_job(child_a, JobStatus::Error, 0, 1, Some("boom"), None).unwrap();

        let all = storage.list_jobs(&JobFilter::default()).unwrap();
        assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![child_b, child_a, root]);

        let errors = storage
            .list_jobs(&JobFilter { status: Some(JobStatus::Error), ..JobFilter::default() })
            .unwrap();
        assert_eq!(errors.len(), 1);

        let roots = storage
            .list_jobs(&JobFilter { roots_only: true, ..JobFilter::default() })
            .unwrap();
        assert_eq!(roots.len(), 1);

        let page = storage
            .list_jobs(&JobFilter { limit: 1, offset: 1, ..JobFilter::default() })
            .unwrap();
        assert_eq!(page[0].id, child_a);

        let children = storage.job_children(root).unwrap();
        assert_eq!(children.iter().map(|j| j.id).collect::<Vec<_>>(), vec![child_a, child_b]);
    }

    #[test]
    fn test_close_abandoned_jobs() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let open = storage.create_job(JobKind::FullSync, None, None, &json!({}), "p1").unwrap();
        let done = storage.create_job(JobKind::Parts, None, None, &json!({}), "p1").unwrap();
        storage.close_job(done, JobStatus::Success, 3, 0, None, None).unwrap();

        let now = chrono::Utc::now().timestamp_millis();
        // the owner's own jobs and fresh heartbeats are left alone
        assert_eq!(storage.close_abandoned_jobs("abandoned", "p1", now).unwrap(), 0);
        assert_eq!(storage.close_abandoned_jobs("abandoned", "p2", now - 60_000).unwrap(), 0);
        assert_eq!(storage.close_abandoned_jobs("abandoned", "p2", now).unwrap(), 1);

        let job = storage.get_job(open).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.completed_at.is_some());
        assert_eq!(storage.get_job(done).unwrap().unwrap().records_processed, 3);
    }

    #[test]
    fn test_touch_jobs_refreshes_open_jobs_of_owner() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let mine = storage.create_job(JobKind::Parts, None, None, &json!({}), "p1").unwrap();
        let theirs = storage.create_job(JobKind::Parts, None, None, &json!({}), "p2").unwrap();
        let done = storage.create_job(JobKind::Parts, None, None, &json!({}), "p1").unwrap();
        storage.close_job(done, JobStatus::Success, 0, 0, None, None).unwrap();

        let later = chrono::Utc::now().timestamp_millis() + 120_000;
        assert_eq!(storage.touch_jobs("p1", later).unwrap(), 1);

        // only p2's job is still stale a minute from now
        let closed = storage.close_abandoned_jobs("abandoned", "p3", later - 60_000).unwrap();
        assert_eq!(closed, 1);
        assert_eq!(storage.get_job(mine).unwrap().unwrap().status, JobStatus::InProgress);
        assert_eq!(storage.get_job(theirs).unwrap().unwrap().status, JobStatus::Error);
    }

    #[test]
    fn test_stats_counts_and_recent_jobs() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        for _ in 0..7 {
            storage.create_job(JobKind::Documents, None, None, &json!({}), "p1").unwrap();
        }
        storage
            .batch("t", |tx| Ok(upsert_workspace(tx, "d1", &workspace("w1", "Main", true), 1)?))
            .unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.workspaces, 1);
        assert_eq!(stats.documents, 0);
        assert_eq!(stats.sync_jobs, 7);
        assert_eq!(stats.recent_jobs.len(), 5);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.db");
        {
            let mut storage = SqliteStorage::open(&path).unwrap();
            storage.create_job(JobKind::Documents, None, None, &json!({}), "p1").unwrap();
        }
        let reopened = SqliteStorage::open(&path).unwrap();
        assert_eq!(reopened.stats().unwrap().sync_jobs, 1);
    }
}
