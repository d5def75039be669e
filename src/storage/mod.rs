//! Local relational store for the sync core.
//!
//! One SQLite database holds the four sync bookkeeping tables
//! (`sync_devices`, `sync_changelog`, `sync_state`, `sync_file_manifest`)
//! plus the syncable domain tables declared in [`registry`]. Writes from
//! the protocol's apply phase run inside the same transaction as cursor
//! advancement, so a crash can never apply a batch twice-visibly or skip
//! one silently.

pub mod registry;

use std::fmt;
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::sync::clock::HlcTimestamp;
use registry::TableSpec;

/// JSON object carried in `changed_fields`.
pub type FieldMap = serde_json::Map<String, Value>;

/// Current UTC time in RFC 3339, the row-timestamp format throughout.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

// ── Row types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Desktop,
    Phone,
    Tablet,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Desktop => "desktop",
            DeviceKind::Phone => "phone",
            DeviceKind::Tablet => "tablet",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "phone" => DeviceKind::Phone,
            "tablet" => DeviceKind::Tablet,
            _ => DeviceKind::Desktop,
        }
    }
}

/// Identity of one device in the sync mesh. Exactly one local row has
/// `is_current = true`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRow {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub last_sync_at: Option<String>,
    pub is_current: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(ChangeOperation::Insert),
            "UPDATE" => Ok(ChangeOperation::Update),
            "DELETE" => Ok(ChangeOperation::Delete),
            other => Err(SyncError::Corrupt(format!("unknown operation: {other}"))),
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded row mutation. Append-only; also the batch wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    #[serde(default = "new_row_id")]
    pub id: String,
    pub hlc_timestamp: HlcTimestamp,
    pub device_id: String,
    pub entity_table: String,
    pub entity_id: String,
    pub operation: ChangeOperation,
    pub changed_fields: Option<FieldMap>,
}

pub fn new_row_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Per-remote-device sync cursors. The row keyed by this device's own id
/// carries the push watermark.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStateRow {
    pub remote_device_id: String,
    pub last_pulled_hlc: Option<String>,
    pub last_pushed_hlc: Option<String>,
}

/// Upload state of one tracked non-row file.
/// `synced_at == None ⇔ cloud_key == None ⇔ upload pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifestRow {
    #[serde(default = "new_row_id")]
    pub id: String,
    pub file_type: String,
    pub file_path: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub cloud_key: Option<String>,
    pub synced_at: Option<String>,
}

// ── Store ───────────────────────────────────────────────────────

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sync_devices (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    device_type TEXT NOT NULL DEFAULT 'desktop',
    last_sync_at TEXT,
    is_current INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sync_changelog (
    id TEXT PRIMARY KEY,
    hlc_timestamp TEXT NOT NULL,
    device_id TEXT NOT NULL,
    entity_table TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    changed_fields TEXT,
    base_version TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_changelog_entity_hlc
    ON sync_changelog (entity_table, entity_id, hlc_timestamp);
CREATE INDEX IF NOT EXISTS ix_changelog_hlc ON sync_changelog (hlc_timestamp);
CREATE TABLE IF NOT EXISTS sync_state (
    remote_device_id TEXT PRIMARY KEY,
    last_pulled_hlc TEXT,
    last_pushed_hlc TEXT,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sync_file_manifest (
    id TEXT PRIMARY KEY,
    file_type TEXT NOT NULL,
    file_path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    cloud_key TEXT,
    synced_at TEXT,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ix_manifest_path_type
    ON sync_file_manifest (file_path, file_type);
";

/// Handle to the local SQLite database. A single connection guarded by a
/// mutex; SQLite's own locking plus WAL mode covers the rest.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA)?;
        for spec in registry::SYNCABLE_TABLES {
            conn.execute_batch(&spec.create_sql())?;
        }
        Ok(())
    }

    /// Run `f` with the connection locked.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Devices ─────────────────────────────────────────────────

    pub fn current_device(&self) -> Result<Option<DeviceRow>> {
        self.with_conn(|conn| {
            query_device(conn, "SELECT id, name, device_type, last_sync_at, is_current, created_at FROM sync_devices WHERE is_current = 1", [])
        })
    }

    pub fn device_by_id(&self, id: &str) -> Result<Option<DeviceRow>> {
        self.with_conn(|conn| {
            query_device(conn, "SELECT id, name, device_type, last_sync_at, is_current, created_at FROM sync_devices WHERE id = ?1", [id])
        })
    }

    pub fn insert_device(&self, device: &DeviceRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_devices (id, name, device_type, last_sync_at, is_current, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    device.id,
                    device.name,
                    device.kind.as_str(),
                    device.last_sync_at,
                    device.is_current,
                    device.created_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, device_type, last_sync_at, is_current, created_at
                 FROM sync_devices ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], device_from_row)?;
            let mut devices = Vec::new();
            for row in rows {
                devices.push(row?);
            }
            Ok(devices)
        })
    }

    pub fn delete_device(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM sync_devices WHERE id = ?1", [id])?;
            conn.execute("DELETE FROM sync_state WHERE remote_device_id = ?1", [id])?;
            Ok(deleted > 0)
        })
    }

    pub fn touch_device_last_sync(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_devices SET last_sync_at = ?1 WHERE id = ?2",
                params![now_rfc3339(), id],
            )?;
            Ok(())
        })
    }

    // ── Changelog ───────────────────────────────────────────────

    pub fn append_changelog(&self, entry: &ChangeLogEntry) -> Result<()> {
        self.with_conn(|conn| append_changelog(conn, entry))
    }

    /// Local entries with `hlc > after`, oldest first.
    pub fn unpushed_entries(
        &self,
        device_id: &str,
        after: Option<&str>,
    ) -> Result<Vec<ChangeLogEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, hlc_timestamp, device_id, entity_table, entity_id, operation, changed_fields
                 FROM sync_changelog
                 WHERE device_id = ?1 AND hlc_timestamp > ?2
                 ORDER BY hlc_timestamp",
            )?;
            let rows = stmt.query_map(params![device_id, after.unwrap_or("")], entry_from_row)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(from_stored_entry(row?)?);
            }
            Ok(entries)
        })
    }

    /// Recent entries for the debug surface, newest first.
    pub fn recent_changelog(
        &self,
        limit: u32,
        entity_table: Option<&str>,
    ) -> Result<Vec<ChangeLogEntry>> {
        self.with_conn(|conn| {
            let mut entries = Vec::new();
            match entity_table {
                Some(table) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, hlc_timestamp, device_id, entity_table, entity_id, operation, changed_fields
                         FROM sync_changelog WHERE entity_table = ?1
                         ORDER BY hlc_timestamp DESC LIMIT ?2",
                    )?;
                    let rows = stmt.query_map(params![table, limit], entry_from_row)?;
                    for row in rows {
                        entries.push(from_stored_entry(row?)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, hlc_timestamp, device_id, entity_table, entity_id, operation, changed_fields
                         FROM sync_changelog ORDER BY hlc_timestamp DESC LIMIT ?1",
                    )?;
                    let rows = stmt.query_map(params![limit], entry_from_row)?;
                    for row in rows {
                        entries.push(from_stored_entry(row?)?);
                    }
                }
            }
            Ok(entries)
        })
    }

    /// Delete already-pushed local entries older than the retention cutoff.
    pub fn prune_changelog(
        &self,
        device_id: &str,
        created_before: &str,
        pushed_watermark: &str,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM sync_changelog
                 WHERE device_id = ?1 AND created_at < ?2 AND hlc_timestamp <= ?3",
                params![device_id, created_before, pushed_watermark],
            )?;
            Ok(deleted)
        })
    }

    // ── Sync state ──────────────────────────────────────────────

    pub fn sync_state(&self, remote_device_id: &str) -> Result<SyncStateRow> {
        self.with_conn(|conn| get_or_create_state(conn, remote_device_id))
    }

    pub fn set_last_pushed(&self, remote_device_id: &str, hlc: &str) -> Result<()> {
        self.with_conn(|conn| set_last_pushed(conn, remote_device_id, hlc))
    }

    // ── File manifest ───────────────────────────────────────────

    pub fn manifest_for(
        &self,
        file_path: &str,
        file_type: &str,
    ) -> Result<Option<FileManifestRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, file_type, file_path, content_hash, size_bytes, cloud_key, synced_at
                 FROM sync_file_manifest WHERE file_path = ?1 AND file_type = ?2",
                params![file_path, file_type],
                manifest_from_row,
            )
            .optional()
            .map_err(SyncError::from)
        })
    }

    /// Insert or update the manifest row for `(file_path, file_type)`,
    /// clearing the upload state.
    pub fn upsert_manifest(&self, row: &FileManifestRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_file_manifest
                     (id, file_type, file_path, content_hash, size_bytes, cloud_key, synced_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6)
                 ON CONFLICT (file_path, file_type) DO UPDATE SET
                     content_hash = excluded.content_hash,
                     size_bytes = excluded.size_bytes,
                     cloud_key = NULL,
                     synced_at = NULL",
                params![
                    row.id,
                    row.file_type,
                    row.file_path,
                    row.content_hash,
                    row.size_bytes,
                    now_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn pending_manifests(&self) -> Result<Vec<FileManifestRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, file_type, file_path, content_hash, size_bytes, cloud_key, synced_at
                 FROM sync_file_manifest WHERE synced_at IS NULL",
            )?;
            let rows = stmt.query_map([], manifest_from_row)?;
            let mut manifests = Vec::new();
            for row in rows {
                manifests.push(row?);
            }
            Ok(manifests)
        })
    }

    pub fn all_manifests(&self) -> Result<Vec<FileManifestRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, file_type, file_path, content_hash, size_bytes, cloud_key, synced_at
                 FROM sync_file_manifest ORDER BY file_path",
            )?;
            let rows = stmt.query_map([], manifest_from_row)?;
            let mut manifests = Vec::new();
            for row in rows {
                manifests.push(row?);
            }
            Ok(manifests)
        })
    }

    /// Stamp a manifest as uploaded at its recorded content hash (I3).
    pub fn mark_manifest_synced(&self, id: &str, cloud_key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_file_manifest SET cloud_key = ?1, synced_at = ?2 WHERE id = ?3",
                params![cloud_key, now_rfc3339(), id],
            )?;
            Ok(())
        })
    }

    pub fn knows_file_hash(&self, content_hash: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sync_file_manifest WHERE content_hash = ?1",
                [content_hash],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }
}

// ── Connection-level helpers (composable inside transactions) ───

pub fn append_changelog(conn: &Connection, entry: &ChangeLogEntry) -> Result<()> {
    let fields_json = entry
        .changed_fields
        .as_ref()
        .map(|f| serde_json::to_string(f))
        .transpose()?;
    conn.execute(
        "INSERT INTO sync_changelog
             (id, hlc_timestamp, device_id, entity_table, entity_id, operation, changed_fields, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.id,
            entry.hlc_timestamp.to_string(),
            entry.device_id,
            entry.entity_table,
            entry.entity_id,
            entry.operation.as_str(),
            fields_json,
            now_rfc3339(),
        ],
    )?;
    Ok(())
}

/// The conservative conflict probe: newest local entry from `device_id`
/// touching the same entity with `hlc ≥ remote_hlc`.
pub fn find_local_conflict(
    conn: &Connection,
    entity_table: &str,
    entity_id: &str,
    device_id: &str,
    remote_hlc: &str,
) -> Result<Option<ChangeLogEntry>> {
    let stored = conn
        .query_row(
            "SELECT id, hlc_timestamp, device_id, entity_table, entity_id, operation, changed_fields
             FROM sync_changelog
             WHERE entity_table = ?1 AND entity_id = ?2 AND device_id = ?3 AND hlc_timestamp >= ?4
             ORDER BY hlc_timestamp DESC LIMIT 1",
            params![entity_table, entity_id, device_id, remote_hlc],
            entry_from_row,
        )
        .optional()?;
    stored.map(from_stored_entry).transpose()
}

pub fn get_or_create_state(conn: &Connection, remote_device_id: &str) -> Result<SyncStateRow> {
    conn.execute(
        "INSERT OR IGNORE INTO sync_state (remote_device_id, last_pulled_hlc, last_pushed_hlc, updated_at)
         VALUES (?1, NULL, NULL, ?2)",
        params![remote_device_id, now_rfc3339()],
    )?;
    let row = conn.query_row(
        "SELECT remote_device_id, last_pulled_hlc, last_pushed_hlc FROM sync_state
         WHERE remote_device_id = ?1",
        [remote_device_id],
        |row| {
            Ok(SyncStateRow {
                remote_device_id: row.get(0)?,
                last_pulled_hlc: row.get(1)?,
                last_pushed_hlc: row.get(2)?,
            })
        },
    )?;
    Ok(row)
}

pub fn set_last_pulled(conn: &Connection, remote_device_id: &str, batch_id: &str) -> Result<()> {
    get_or_create_state(conn, remote_device_id)?;
    conn.execute(
        "UPDATE sync_state SET last_pulled_hlc = ?1, updated_at = ?2 WHERE remote_device_id = ?3",
        params![batch_id, now_rfc3339(), remote_device_id],
    )?;
    Ok(())
}

pub fn set_last_pushed(conn: &Connection, remote_device_id: &str, hlc: &str) -> Result<()> {
    get_or_create_state(conn, remote_device_id)?;
    conn.execute(
        "UPDATE sync_state SET last_pushed_hlc = ?1, updated_at = ?2 WHERE remote_device_id = ?3",
        params![hlc, now_rfc3339(), remote_device_id],
    )?;
    Ok(())
}

// ── Domain row access via the registry ──────────────────────────

pub fn row_exists(conn: &Connection, spec: &TableSpec, id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE \"{}\" = ?1",
            spec.name, spec.pk
        ),
        [id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Read all non-null columns of a row as a JSON field map.
pub fn read_row(conn: &Connection, spec: &TableSpec, id: &str) -> Result<Option<FieldMap>> {
    let cols: Vec<String> = spec.columns.iter().map(|c| format!("\"{c}\"")).collect();
    let sql = format!(
        "SELECT {} FROM {} WHERE \"{}\" = ?1",
        cols.join(", "),
        spec.name,
        spec.pk
    );
    let row = conn
        .query_row(&sql, [id], |row| {
            let mut map = FieldMap::new();
            for (i, col) in spec.columns.iter().enumerate() {
                let value = sql_to_json(row.get_ref(i)?);
                if !value.is_null() {
                    map.insert((*col).to_string(), value);
                }
            }
            Ok(map)
        })
        .optional()?;
    Ok(row)
}

/// Insert a fresh row with the given primary key and known fields. Fields
/// outside the table spec are dropped.
pub fn insert_row(conn: &Connection, spec: &TableSpec, id: &str, fields: &FieldMap) -> Result<()> {
    let mut columns = vec![format!("\"{}\"", spec.pk)];
    let mut values: Vec<SqlValue> = vec![SqlValue::Text(id.to_string())];
    for (key, value) in fields {
        if !spec.has_column(key) {
            tracing::debug!(table = spec.name, column = %key, "Skipping unknown column");
            continue;
        }
        columns.push(format!("\"{key}\""));
        values.push(json_to_sql(value));
    }
    let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        spec.name,
        columns.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

/// Overwrite the listed columns of an existing row. The primary key is
/// never writable; unknown columns are dropped.
pub fn update_row(conn: &Connection, spec: &TableSpec, id: &str, fields: &FieldMap) -> Result<()> {
    let mut assignments = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    for (key, value) in fields {
        if key == spec.pk || !spec.has_column(key) {
            if key != spec.pk {
                tracing::debug!(table = spec.name, column = %key, "Skipping unknown column");
            }
            continue;
        }
        values.push(json_to_sql(value));
        assignments.push(format!("\"{key}\" = ?{}", values.len()));
    }
    if assignments.is_empty() {
        return Ok(());
    }
    values.push(SqlValue::Text(id.to_string()));
    let sql = format!(
        "UPDATE {} SET {} WHERE \"{}\" = ?{}",
        spec.name,
        assignments.join(", "),
        spec.pk,
        values.len()
    );
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

pub fn delete_row(conn: &Connection, spec: &TableSpec, id: &str) -> Result<bool> {
    let deleted = conn.execute(
        &format!("DELETE FROM {} WHERE \"{}\" = ?1", spec.name, spec.pk),
        [id],
    )?;
    Ok(deleted > 0)
}

/// Apply one remote changelog entry to the local store. Returns `true`
/// when the entry changed local state. Idempotent: INSERT of an existing
/// row degrades to an UPDATE merge, UPDATE of a missing row is dropped.
pub fn apply_remote_entry(conn: &Connection, entry: &ChangeLogEntry) -> Result<bool> {
    let spec = registry::table_spec(&entry.entity_table)
        .ok_or_else(|| SyncError::SchemaUnknown(entry.entity_table.clone()))?;
    let empty = FieldMap::new();
    let fields = entry.changed_fields.as_ref().unwrap_or(&empty);

    match entry.operation {
        ChangeOperation::Delete => delete_row(conn, spec, &entry.entity_id),
        ChangeOperation::Insert => {
            if row_exists(conn, spec, &entry.entity_id)? {
                update_row(conn, spec, &entry.entity_id, fields)?;
            } else {
                insert_row(conn, spec, &entry.entity_id, fields)?;
            }
            Ok(true)
        }
        ChangeOperation::Update => {
            if row_exists(conn, spec, &entry.entity_id)? {
                update_row(conn, spec, &entry.entity_id, fields)?;
                Ok(true)
            } else {
                // Tombstone reconciliation is left to DELETE_WINS on a
                // later entry.
                Ok(false)
            }
        }
    }
}

// ── Value conversion ────────────────────────────────────────────

/// JSON → SQLite storage class. Arrays and objects are stored as their
/// JSON text; booleans as 0/1.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub fn sql_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

/// Normalize a JSON value to its storage-class image, so comparing a
/// proposed field against a read-back row is exact.
pub fn normalize_for_diff(value: &Value) -> Value {
    match value {
        Value::Bool(b) => Value::from(i64::from(*b)),
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        other => other.clone(),
    }
}

// ── Row mappers ─────────────────────────────────────────────────

fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceRow> {
    let kind: String = row.get(2)?;
    Ok(DeviceRow {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: DeviceKind::parse(&kind),
        last_sync_at: row.get(3)?,
        is_current: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn query_device<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Option<DeviceRow>> {
    conn.query_row(sql, params, device_from_row)
        .optional()
        .map_err(SyncError::from)
}

/// Intermediate tuple mapped straight off a changelog row; converted with
/// [`from_stored_entry`] outside the rusqlite error domain.
type StoredEntry = (String, String, String, String, String, String, Option<String>);

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEntry> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn from_stored_entry(stored: StoredEntry) -> Result<ChangeLogEntry> {
    let (id, hlc, device_id, entity_table, entity_id, operation, fields_json) = stored;
    Ok(ChangeLogEntry {
        id,
        hlc_timestamp: hlc
            .parse()
            .map_err(|e: String| SyncError::Corrupt(e))?,
        device_id,
        entity_table,
        entity_id,
        operation: ChangeOperation::parse(&operation)?,
        changed_fields: fields_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
    })
}

fn manifest_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileManifestRow> {
    Ok(FileManifestRow {
        id: row.get(0)?,
        file_type: row.get(1)?,
        file_path: row.get(2)?,
        content_hash: row.get(3)?,
        size_bytes: row.get::<_, i64>(4)? as u64,
        cloud_key: row.get(5)?,
        synced_at: row.get(6)?,
    })
}
