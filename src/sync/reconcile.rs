//! Idempotent per-entity reconciliation.
//!
//! Reconciling a batch is two steps:
//!
//! 1. [`stage`] classifies every raw record as a keyed record, a key-less
//!    record (dropped, counted as skipped) or an invalid one (one error).
//! 2. [`apply`] writes the keyed records in a single IMMEDIATE transaction.
//!    Each record gets its own savepoint, so one failing row rolls back alone
//!    and the rest of the batch still commits.
//!
//! Callers that need secondary data per record (mass properties) fill it in
//! between the two steps.

use rusqlite::Connection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;
use crate::remote::types::{
    RemoteDocument, RemoteElement, RemoteFeature, RemotePart, RemoteWorkspace,
};
use crate::storage::SharedStorage;
use crate::storage::sqlite::{
    Upserted, upsert_document, upsert_element, upsert_feature, upsert_part, upsert_workspace,
};

/// Outcome counts for one reconciled batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    /// Records written (created + updated).
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    /// Key-less records and records intentionally left alone.
    pub skipped: u64,
    pub errors: u64,
}

impl BatchStats {
    pub fn merge(&mut self, other: Self) {
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// A staged record.
#[derive(Debug)]
pub enum Incoming<T> {
    Record(T),
    MissingKey,
    Invalid(String),
}

/// Where a batch hangs in the hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Parent<'a> {
    /// External key of the parent; empty for documents.
    pub key: &'a str,
    /// Workspace the records were observed in (elements only).
    pub workspace_id: Option<&'a str>,
}

impl<'a> Parent<'a> {
    /// Top of the hierarchy.
    pub const ROOT: Parent<'static> = Parent {
        key: "",
        workspace_id: None,
    };

    #[must_use]
    pub const fn of(key: &'a str) -> Self {
        Self {
            key,
            workspace_id: None,
        }
    }

    #[must_use]
    pub const fn in_workspace(key: &'a str, workspace_id: &'a str) -> Self {
        Self {
            key,
            workspace_id: Some(workspace_id),
        }
    }
}

/// A remote entity type that can be mirrored.
pub trait Mirrored: DeserializeOwned {
    /// Entity name used in logs.
    const ENTITY: &'static str;
    /// JSON field holding the external key.
    const KEY_FIELD: &'static str;

    fn key(&self) -> &str;

    /// Upsert this record by external key.
    ///
    /// # Errors
    ///
    /// Returns the underlying SQLite error.
    fn write(&self, conn: &Connection, parent: Parent<'_>, now: i64) -> rusqlite::Result<Upserted>;

    /// Errors this record carries in from best-effort sub-fetches.
    fn carried_errors(&self) -> u64 {
        0
    }
}

impl Mirrored for RemoteDocument {
    const ENTITY: &'static str = "document";
    const KEY_FIELD: &'static str = "id";

    fn key(&self) -> &str {
        &self.id
    }

    fn write(&self, conn: &Connection, _parent: Parent<'_>, now: i64) -> rusqlite::Result<Upserted> {
        upsert_document(conn, self, now)
    }
}

impl Mirrored for RemoteWorkspace {
    const ENTITY: &'static str = "workspace";
    const KEY_FIELD: &'static str = "id";

    fn key(&self) -> &str {
        &self.id
    }

    fn write(&self, conn: &Connection, parent: Parent<'_>, now: i64) -> rusqlite::Result<Upserted> {
        upsert_workspace(conn, parent.key, self, now)
    }
}

impl Mirrored for RemoteElement {
    const ENTITY: &'static str = "element";
    const KEY_FIELD: &'static str = "id";

    fn key(&self) -> &str {
        &self.id
    }

    fn write(&self, conn: &Connection, parent: Parent<'_>, now: i64) -> rusqlite::Result<Upserted> {
        upsert_element(conn, parent.key, parent.workspace_id, self, now)
    }
}

impl Mirrored for RemotePart {
    const ENTITY: &'static str = "part";
    const KEY_FIELD: &'static str = "partId";

    fn key(&self) -> &str {
        &self.part_id
    }

    fn write(&self, conn: &Connection, parent: Parent<'_>, now: i64) -> rusqlite::Result<Upserted> {
        upsert_part(conn, parent.key, self, now)
    }

    fn carried_errors(&self) -> u64 {
        u64::from(self.mass_properties.as_ref().is_some_and(|m| m.is_failed()))
    }
}

impl Mirrored for RemoteFeature {
    const ENTITY: &'static str = "feature";
    const KEY_FIELD: &'static str = "featureId";

    fn key(&self) -> &str {
        &self.feature_id
    }

    fn write(&self, conn: &Connection, parent: Parent<'_>, now: i64) -> rusqlite::Result<Upserted> {
        upsert_feature(conn, parent.key, self, now)
    }
}

/// Classify raw records.
#[must_use]
pub fn stage<T: Mirrored>(records: Vec<Value>) -> Vec<Incoming<T>> {
    records.into_iter().map(stage_one).collect()
}

/// External key of a raw record, before it is parsed.
#[derive(Debug, PartialEq, Eq)]
pub enum RawKey<'a> {
    Present(&'a str),
    /// Absent, null or empty: the record is dropped and only skipped.
    Missing,
    /// Wrong shape: counts as one error.
    Invalid(String),
}

/// Read `T`'s key field from a raw record.
#[must_use]
pub fn raw_key<T: Mirrored>(raw: &Value) -> RawKey<'_> {
    let Some(obj) = raw.as_object() else {
        return RawKey::Invalid(format!("{} is not a JSON object", T::ENTITY));
    };

    match obj.get(T::KEY_FIELD) {
        None | Some(Value::Null) => RawKey::Missing,
        Some(Value::String(s)) if s.is_empty() => RawKey::Missing,
        Some(Value::String(s)) => RawKey::Present(s),
        Some(other) => {
            RawKey::Invalid(format!("{} has non-string {}: {other}", T::ENTITY, T::KEY_FIELD))
        }
    }
}

fn stage_one<T: Mirrored>(raw: Value) -> Incoming<T> {
    match raw_key::<T>(&raw) {
        RawKey::Present(_) => {}
        RawKey::Missing => return Incoming::MissingKey,
        RawKey::Invalid(reason) => return Incoming::Invalid(reason),
    }

    match serde_json::from_value::<T>(raw) {
        Ok(record) => Incoming::Record(record),
        Err(e) => Incoming::Invalid(format!("{}: {e}", T::ENTITY)),
    }
}

/// Persist a staged batch.
///
/// # Errors
///
/// Only a failure to begin or commit the transaction is returned; per-record
/// failures are counted in [`BatchStats::errors`].
pub fn apply<T: Mirrored>(
    storage: &SharedStorage,
    parent: Parent<'_>,
    staged: Vec<Incoming<T>>,
) -> Result<BatchStats> {
    if staged.is_empty() {
        return Ok(BatchStats::default());
    }

    storage.with(|s| {
        s.batch(T::ENTITY, |tx| {
            let now = chrono::Utc::now().timestamp_millis();
            let mut stats = BatchStats::default();

            for item in staged {
                let record = match item {
                    Incoming::Record(record) => record,
                    Incoming::MissingKey => {
                        stats.skipped += 1;
                        continue;
                    }
                    Incoming::Invalid(reason) => {
                        tracing::warn!(entity = T::ENTITY, parent = parent.key, %reason, "Rejected record");
                        stats.errors += 1;
                        continue;
                    }
                };

                let sp = tx.savepoint()?;
                let written = match record.write(&sp, parent, now) {
                    Ok(kind) => sp.commit().map(|()| kind),
                    // dropping the savepoint rolls it back
                    Err(e) => Err(e),
                };

                match written {
                    Ok(kind) => {
                        stats.processed += 1;
                        match kind {
                            Upserted::Created => stats.created += 1,
                            Upserted::Updated => stats.updated += 1,
                        }
                        stats.errors += record.carried_errors();
                    }
                    Err(e) => {
                        tracing::warn!(
                            entity = T::ENTITY,
                            key = record.key(),
                            error = %e,
                            "Failed to write record"
                        );
                        stats.errors += 1;
                    }
                }
            }

            Ok(stats)
        })
    })
}

/// Stage and persist in one call.
///
/// # Errors
///
/// See [`apply`].
pub fn reconcile<T: Mirrored>(
    storage: &SharedStorage,
    parent: Parent<'_>,
    records: Vec<Value>,
) -> Result<BatchStats> {
    apply(storage, parent, stage::<T>(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::BestEffort;
    use crate::storage::SqliteStorage;
    use serde_json::json;

    fn storage() -> SharedStorage {
        SharedStorage::new(SqliteStorage::open_memory().unwrap())
    }

    #[test]
    fn test_workspaces_reconcile_idempotently() {
        let storage = storage();
        let payload = vec![
            json!({"id": "w1", "name": "Main", "isMain": true}),
            json!({"id": "w2", "name": "Branch", "isMain": false}),
        ];

        let first = reconcile::<RemoteWorkspace>(&storage, Parent::of("d1"), payload.clone()).unwrap();
        let second = reconcile::<RemoteWorkspace>(&storage, Parent::of("d1"), payload).unwrap();

        assert_eq!(first.processed, 2);
        assert_eq!(first.created, 2);
        assert_eq!(second.processed, 2);
        assert_eq!(second.updated, 2);
        assert_eq!(second.created, 0);

        storage
            .with(|s| {
                assert_eq!(s.list_workspaces(Some("d1"), 50, 0)?.len(), 2);
                assert_eq!(s.main_workspace("d1")?.unwrap().workspace_id, "w1");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_each_entity_type_is_idempotent() {
        let storage = storage();

        for _ in 0..2 {
            reconcile::<RemoteDocument>(
                &storage,
                Parent::ROOT,
                vec![json!({"id": "d1", "name": "Gearbox", "owner": {"id": "u1", "name": "Ada"}, "public": true})],
            )
            .unwrap();
            reconcile::<RemoteElement>(
                &storage,
                Parent::in_workspace("d1", "w1"),
                vec![json!({"id": "e1", "name": "Part Studio 1", "elementType": "PARTSTUDIO"})],
            )
            .unwrap();
            reconcile::<RemotePart>(
                &storage,
                Parent::of("e1"),
                vec![json!({"partId": "p1", "name": "Shaft"})],
            )
            .unwrap();
            reconcile::<RemoteFeature>(
                &storage,
                Parent::of("e1"),
                vec![json!({"featureId": "f1", "name": "Extrude 1", "featureType": "extrude", "parameters": [{"id": "depth"}]})],
            )
            .unwrap();
        }

        let stats = storage.with(|s| s.stats()).unwrap();
        assert_eq!(
            (stats.documents, stats.elements, stats.parts, stats.features),
            (1, 1, 1, 1)
        );

        let doc = storage.with(|s| s.get_document("d1")).unwrap().unwrap();
        assert_eq!(doc.owner_name.as_deref(), Some("Ada"));
        assert!(doc.public);

        let feature = storage.with(|s| s.get_feature("f1", None)).unwrap().unwrap();
        assert_eq!(feature.parameters, Some(json!([{"id": "depth"}])));
    }

    #[test]
    fn test_keyless_records_are_dropped_and_not_counted() {
        let storage = storage();
        let payload = vec![
            json!({"partId": "p1", "name": "A"}),
            json!({"name": "no key"}),
            json!({"partId": "p2", "name": "B"}),
            json!({"partId": "", "name": "empty key"}),
            json!({"partId": null}),
            json!({"partId": "p3", "name": "C"}),
        ];

        let stats = reconcile::<RemotePart>(&storage, Parent::of("e1"), payload).unwrap();

        assert_eq!(stats.processed, 3);
        assert_eq!(stats.skipped, 3);
        assert_eq!(stats.errors, 0);
        assert_eq!(storage.with(|s| s.list_parts(Some("e1"), 50, 0)).unwrap().len(), 3);
    }

    #[test]
    fn test_invalid_record_counts_one_error_and_batch_continues() {
        let storage = storage();
        let payload = vec![
            json!({"id": "e1", "name": "Good"}),
            json!({"id": 42}),
            json!({"id": "e3", "name": ["not", "a", "string"]}),
            json!("just a string"),
            json!({"id": "e5", "name": "Also good"}),
        ];

        let stats = reconcile::<RemoteElement>(&storage, Parent::of("d1"), payload).unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.errors, 3);
    }

    #[test]
    fn test_same_part_id_in_two_studios_keeps_two_rows() {
        let storage = storage();

        for _ in 0..2 {
            for (element_id, name) in [("e1", "Shaft"), ("e2", "Bracket")] {
                let parts = vec![json!({"partId": "JHD", "name": name})];
                let features = vec![json!({"featureId": "F1", "name": format!("{name} sketch")})];
                reconcile::<RemotePart>(&storage, Parent::of(element_id), parts).unwrap();
                reconcile::<RemoteFeature>(&storage, Parent::of(element_id), features).unwrap();
            }
        }

        let stats = storage.with(|s| s.stats()).unwrap();
        assert_eq!((stats.parts, stats.features), (2, 2));

        let second = storage.with(|s| s.get_part("JHD", Some("e2"))).unwrap().unwrap();
        assert_eq!(second.element_id, "e2");
        assert_eq!(second.name, "Bracket");
        let first = storage.with(|s| s.get_feature("F1", Some("e1"))).unwrap().unwrap();
        assert_eq!(first.name, "Shaft sketch");
    }

    #[test]
    fn test_raw_key_classification() {
        assert_eq!(raw_key::<RemoteDocument>(&json!({"id": "d1"})), RawKey::Present("d1"));
        assert_eq!(raw_key::<RemoteDocument>(&json!({"id": ""})), RawKey::Missing);
        assert_eq!(raw_key::<RemoteDocument>(&json!({"id": null})), RawKey::Missing);
        assert_eq!(raw_key::<RemotePart>(&json!({"id": "x"})), RawKey::Missing);
        assert!(matches!(raw_key::<RemoteDocument>(&json!({"id": 17})), RawKey::Invalid(_)));
        assert!(matches!(raw_key::<RemoteDocument>(&json!("d1")), RawKey::Invalid(_)));
    }

    #[test]
    fn test_failed_sub_fetch_still_processed_with_one_error() {
        let storage = storage();
        let mut staged = stage::<RemotePart>(vec![
            json!({"partId": "p1"}),
            json!({"partId": "p2"}),
        ]);
        for (i, item) in staged.iter_mut().enumerate() {
            if let Incoming::Record(part) = item {
                part.mass_properties = Some(if i == 0 {
                    BestEffort::Fetched(json!({"mass": [2.0]}))
                } else {
                    BestEffort::Failed("503".into())
                });
            }
        }

        let stats = apply(&storage, Parent::of("e1"), staged).unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.errors, 1);

        let p2 = storage.with(|s| s.get_part("p2", None)).unwrap().unwrap();
        assert!(p2.mass_properties.is_none());
    }

    #[test]
    fn test_empty_batch_touches_nothing() {
        let storage = storage();
        let stats = reconcile::<RemoteFeature>(&storage, Parent::of("e1"), vec![]).unwrap();
        assert_eq!(stats, BatchStats::default());
    }
}
