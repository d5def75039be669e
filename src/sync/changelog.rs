//! Change tracking for syncable tables.
//!
//! Every local mutation flows through [`TrackedWrites`], which writes the
//! row and appends exactly one changelog entry inside the same transaction.
//! The apply phase of a sync wraps its writes in [`ChangeTracker::suppress`]
//! so remotely-applied rows are never re-logged — the alternative is an
//! infinite replication echo between devices.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::storage::registry;
use crate::storage::{
    self, ChangeLogEntry, ChangeOperation, FieldMap, Store,
};
use crate::sync::clock::HybridLogicalClock;

/// Mints changelog entries stamped by the device clock, with a suppression
/// switch for the sync apply phase.
pub struct ChangeTracker {
    clock: Arc<HybridLogicalClock>,
    device_id: String,
    suppress_depth: AtomicUsize,
}

impl ChangeTracker {
    pub fn new(clock: Arc<HybridLogicalClock>, device_id: impl Into<String>) -> Self {
        Self {
            clock,
            device_id: device_id.into(),
            suppress_depth: AtomicUsize::new(0),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Disable tracking until the returned guard is dropped. Nestable.
    pub fn suppress(&self) -> SuppressGuard<'_> {
        self.suppress_depth.fetch_add(1, Ordering::SeqCst);
        SuppressGuard { tracker: self }
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppress_depth.load(Ordering::SeqCst) > 0
    }

    /// Build a changelog entry for a mutation happening now.
    pub fn make_entry(
        &self,
        entity_table: &str,
        entity_id: &str,
        operation: ChangeOperation,
        changed_fields: Option<FieldMap>,
    ) -> ChangeLogEntry {
        ChangeLogEntry {
            id: storage::new_row_id(),
            hlc_timestamp: self.clock.now(),
            device_id: self.device_id.clone(),
            entity_table: entity_table.to_string(),
            entity_id: entity_id.to_string(),
            operation,
            changed_fields,
        }
    }
}

/// Re-enables tracking on drop.
pub struct SuppressGuard<'a> {
    tracker: &'a ChangeTracker,
}

impl Drop for SuppressGuard<'_> {
    fn drop(&mut self) {
        self.tracker.suppress_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Write adapter for syncable tables: the only sanctioned path for local
/// mutations. Row write and changelog append share one transaction, so a
/// committed write implies a logged change and vice versa.
pub struct TrackedWrites<'a> {
    store: &'a Store,
    tracker: &'a ChangeTracker,
}

impl<'a> TrackedWrites<'a> {
    pub fn new(store: &'a Store, tracker: &'a ChangeTracker) -> Self {
        Self { store, tracker }
    }

    /// Insert a fresh row. The changelog entry captures all non-null
    /// fields at creation.
    pub fn insert(&self, table: &str, entity_id: &str, fields: FieldMap) -> Result<()> {
        let spec = registry::table_spec(table)
            .ok_or_else(|| SyncError::SchemaUnknown(table.to_string()))?;

        let captured: FieldMap = fields
            .iter()
            .filter(|(k, v)| !v.is_null() && spec.has_column(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        self.store.with_tx(|conn| {
            if storage::row_exists(conn, spec, entity_id)? {
                return Err(SyncError::StateConflict(format!(
                    "{table} row {entity_id} already exists"
                )));
            }
            storage::insert_row(conn, spec, entity_id, &fields)?;
            if !self.tracker.is_suppressed() {
                let entry = self.tracker.make_entry(
                    table,
                    entity_id,
                    ChangeOperation::Insert,
                    Some(captured),
                );
                storage::append_changelog(conn, &entry)?;
            }
            Ok(())
        })
    }

    /// Update an existing row. Only columns whose value actually changes
    /// are written and logged; a proposal that changes nothing emits no
    /// entry at all.
    pub fn update(&self, table: &str, entity_id: &str, fields: FieldMap) -> Result<()> {
        let spec = registry::table_spec(table)
            .ok_or_else(|| SyncError::SchemaUnknown(table.to_string()))?;

        self.store.with_tx(|conn| {
            let current = storage::read_row(conn, spec, entity_id)?.ok_or_else(|| {
                SyncError::BadRequest(format!("{table} row {entity_id} does not exist"))
            })?;

            let mut changed = FieldMap::new();
            for (key, value) in &fields {
                if !spec.has_column(key) {
                    tracing::debug!(table, column = %key, "Ignoring unknown column");
                    continue;
                }
                let unchanged = match current.get(key) {
                    Some(existing) => *existing == storage::normalize_for_diff(value),
                    None => value.is_null(),
                };
                if !unchanged {
                    changed.insert(key.clone(), value.clone());
                }
            }

            if changed.is_empty() {
                return Ok(());
            }

            storage::update_row(conn, spec, entity_id, &changed)?;
            if !self.tracker.is_suppressed() {
                let entry = self.tracker.make_entry(
                    table,
                    entity_id,
                    ChangeOperation::Update,
                    Some(changed),
                );
                storage::append_changelog(conn, &entry)?;
            }
            Ok(())
        })
    }

    /// Delete a row if present. Deleting a missing row is a no-op and
    /// emits nothing.
    pub fn delete(&self, table: &str, entity_id: &str) -> Result<()> {
        let spec = registry::table_spec(table)
            .ok_or_else(|| SyncError::SchemaUnknown(table.to_string()))?;

        self.store.with_tx(|conn| {
            let deleted = storage::delete_row(conn, spec, entity_id)?;
            if deleted && !self.tracker.is_suppressed() {
                let entry =
                    self.tracker
                        .make_entry(table, entity_id, ChangeOperation::Delete, None);
                storage::append_changelog(conn, &entry)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> (Store, ChangeTracker) {
        let store = Store::open_in_memory().unwrap();
        let clock = Arc::new(HybridLogicalClock::new("dev-a"));
        let tracker = ChangeTracker::new(clock, "dev-a");
        (store, tracker)
    }

    fn fields(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn insert_logs_non_null_fields() {
        let (store, tracker) = fixture();
        let writes = TrackedWrites::new(&store, &tracker);

        writes
            .insert(
                "meetings",
                "m1",
                fields(&[("title", json!("standup")), ("ended_at", json!(null))]),
            )
            .unwrap();

        let log = store.unpushed_entries("dev-a", None).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].operation, ChangeOperation::Insert);
        assert_eq!(log[0].entity_id, "m1");
        let captured = log[0].changed_fields.as_ref().unwrap();
        assert_eq!(captured["title"], json!("standup"));
        assert!(!captured.contains_key("ended_at"));
    }

    #[test]
    fn update_logs_only_actual_changes() {
        let (store, tracker) = fixture();
        let writes = TrackedWrites::new(&store, &tracker);

        writes
            .insert(
                "meetings",
                "m1",
                fields(&[("title", json!("standup")), ("status", json!("recording"))]),
            )
            .unwrap();

        writes
            .update(
                "meetings",
                "m1",
                fields(&[
                    ("title", json!("standup")),      // unchanged
                    ("status", json!("complete")),    // changed
                ]),
            )
            .unwrap();

        let log = store.unpushed_entries("dev-a", None).unwrap();
        assert_eq!(log.len(), 2);
        let update = &log[1];
        assert_eq!(update.operation, ChangeOperation::Update);
        let captured = update.changed_fields.as_ref().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured["status"], json!("complete"));
    }

    #[test]
    fn no_op_update_emits_nothing() {
        let (store, tracker) = fixture();
        let writes = TrackedWrites::new(&store, &tracker);

        writes
            .insert("meetings", "m1", fields(&[("title", json!("t"))]))
            .unwrap();
        writes
            .update("meetings", "m1", fields(&[("title", json!("t"))]))
            .unwrap();

        let log = store.unpushed_entries("dev-a", None).unwrap();
        assert_eq!(log.len(), 1); // only the insert
    }

    #[test]
    fn delete_logs_without_fields() {
        let (store, tracker) = fixture();
        let writes = TrackedWrites::new(&store, &tracker);

        writes
            .insert("meetings", "m1", fields(&[("title", json!("t"))]))
            .unwrap();
        writes.delete("meetings", "m1").unwrap();
        // Deleting again: nothing happened, nothing logged.
        writes.delete("meetings", "m1").unwrap();

        let log = store.unpushed_entries("dev-a", None).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].operation, ChangeOperation::Delete);
        assert!(log[1].changed_fields.is_none());
    }

    #[test]
    fn one_entry_per_mutation_with_increasing_hlc() {
        let (store, tracker) = fixture();
        let writes = TrackedWrites::new(&store, &tracker);

        for i in 0..10 {
            writes
                .insert(
                    "speakers",
                    &format!("s{i}"),
                    fields(&[("label", json!(format!("Speaker {i}")))]),
                )
                .unwrap();
        }

        let log = store.unpushed_entries("dev-a", None).unwrap();
        assert_eq!(log.len(), 10);
        for pair in log.windows(2) {
            assert!(pair[0].hlc_timestamp < pair[1].hlc_timestamp);
        }
    }

    #[test]
    fn suppressed_writes_emit_no_entries() {
        let (store, tracker) = fixture();
        let writes = TrackedWrites::new(&store, &tracker);

        {
            let _guard = tracker.suppress();
            assert!(tracker.is_suppressed());
            writes
                .insert("meetings", "m1", fields(&[("title", json!("remote"))]))
                .unwrap();
            writes
                .update("meetings", "m1", fields(&[("title", json!("remote2"))]))
                .unwrap();
            writes.delete("meetings", "m1").unwrap();
        }
        assert!(!tracker.is_suppressed());

        assert!(store.unpushed_entries("dev-a", None).unwrap().is_empty());
    }

    #[test]
    fn suppression_nests() {
        let (_store, tracker) = fixture();
        let outer = tracker.suppress();
        {
            let _inner = tracker.suppress();
            assert!(tracker.is_suppressed());
        }
        assert!(tracker.is_suppressed());
        drop(outer);
        assert!(!tracker.is_suppressed());
    }

    #[test]
    fn unknown_table_is_rejected() {
        let (store, tracker) = fixture();
        let writes = TrackedWrites::new(&store, &tracker);
        assert!(matches!(
            writes.insert("nope", "x", FieldMap::new()),
            Err(SyncError::SchemaUnknown(_))
        ));
    }

    #[test]
    fn duplicate_insert_is_a_state_conflict() {
        let (store, tracker) = fixture();
        let writes = TrackedWrites::new(&store, &tracker);
        writes
            .insert("meetings", "m1", fields(&[("title", json!("t"))]))
            .unwrap();
        assert!(matches!(
            writes.insert("meetings", "m1", fields(&[("title", json!("t"))])),
            Err(SyncError::StateConflict(_))
        ));
    }

    #[test]
    fn update_missing_row_is_bad_request() {
        let (store, tracker) = fixture();
        let writes = TrackedWrites::new(&store, &tracker);
        assert!(matches!(
            writes.update("meetings", "ghost", fields(&[("title", json!("t"))])),
            Err(SyncError::BadRequest(_))
        ));
    }
}
