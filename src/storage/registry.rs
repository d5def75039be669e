//! Static registry of syncable tables.
//!
//! The change tracker and the remote-apply path are schema-agnostic: both
//! consult this registry instead of reflecting over a live schema. Adding a
//! table to sync means adding one entry here (and its DDL below) — nothing
//! else changes.
//!
//! Non-key columns are declared without a type affinity so remote values
//! keep the storage class of their JSON representation.

/// Shape of one syncable table.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    /// Primary-key column. Every LIME table uses a single string id;
    /// composite keys would arrive as a JSON array in `entity_id`.
    pub pk: &'static str,
    /// All non-key columns, the complete set remote fields are checked
    /// against. Fields outside this list are never written.
    pub columns: &'static [&'static str],
}

/// The syncable set: meeting capture, analysis children, and the
/// knowledge-graph entity/junction tables.
pub const SYNCABLE_TABLES: &[TableSpec] = &[
    TableSpec {
        name: "meetings",
        pk: "id",
        columns: &[
            "title",
            "status",
            "audio_source",
            "started_at",
            "ended_at",
            "duration_seconds",
            "raw_audio_path",
            "compressed_audio_path",
            "audio_compressed",
        ],
    },
    TableSpec {
        name: "speakers",
        pk: "id",
        columns: &["label", "name", "voice_profile_path", "created_at"],
    },
    TableSpec {
        name: "meeting_speakers",
        pk: "id",
        columns: &["meeting_id", "speaker_id", "diarization_label"],
    },
    TableSpec {
        name: "transcript_segments",
        pk: "id",
        columns: &[
            "meeting_id",
            "speaker_id",
            "start_time",
            "end_time",
            "text",
            "language",
            "confidence",
            "is_low_confidence",
            "transcription_source",
            "created_at",
        ],
    },
    TableSpec {
        name: "meeting_analyses",
        pk: "id",
        columns: &[
            "meeting_id",
            "executive_summary",
            "meeting_type",
            "sentiment",
            "overall_confidence",
            "llm_provider",
            "processed_at",
            "processing_duration_seconds",
            "connections_data",
            "insights_data",
        ],
    },
    TableSpec {
        name: "action_items",
        pk: "id",
        columns: &[
            "analysis_id",
            "description",
            "owner",
            "deadline",
            "priority",
            "confidence",
            "source_quote",
            "source_start_time",
            "source_end_time",
        ],
    },
    TableSpec {
        name: "analysis_decisions",
        pk: "id",
        columns: &[
            "analysis_id",
            "description",
            "context",
            "participants",
            "confidence",
            "source_quote",
            "source_start_time",
            "source_end_time",
        ],
    },
    TableSpec {
        name: "topic_segments",
        pk: "id",
        columns: &[
            "analysis_id",
            "title",
            "summary",
            "start_time",
            "end_time",
            "order_index",
            "confidence",
            "related_segment_ids",
        ],
    },
    TableSpec {
        name: "user_corrections",
        pk: "id",
        columns: &[
            "analysis_id",
            "meeting_id",
            "correction_type",
            "target_id",
            "field_name",
            "original_value",
            "corrected_value",
            "created_at",
        ],
    },
    TableSpec {
        name: "people",
        pk: "id",
        columns: &[
            "name",
            "role",
            "organization",
            "notes",
            "first_seen",
            "last_seen",
            "speaker_id",
        ],
    },
    TableSpec {
        name: "projects",
        pk: "id",
        columns: &["name", "description", "status", "created_at", "updated_at"],
    },
    TableSpec {
        name: "decisions",
        pk: "id",
        columns: &[
            "summary",
            "context",
            "status",
            "confidence",
            "made_at",
            "meeting_id",
            "project_id",
            "owner_id",
        ],
    },
    TableSpec {
        name: "topics",
        pk: "id",
        columns: &["name", "description", "first_seen", "last_seen"],
    },
    TableSpec {
        name: "person_meetings",
        pk: "id",
        columns: &["person_id", "meeting_id", "role_in_meeting", "created_at"],
    },
    TableSpec {
        name: "project_meetings",
        pk: "id",
        columns: &["project_id", "meeting_id", "created_at"],
    },
    TableSpec {
        name: "topic_meetings",
        pk: "id",
        columns: &["topic_id", "meeting_id", "created_at"],
    },
];

/// Look up a table by name. `None` means the table is not syncable on this
/// device (remote entries for it are skipped as `SchemaUnknown`).
pub fn table_spec(name: &str) -> Option<&'static TableSpec> {
    SYNCABLE_TABLES.iter().find(|spec| spec.name == name)
}

pub fn is_syncable(name: &str) -> bool {
    table_spec(name).is_some()
}

impl TableSpec {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(&column)
    }

    /// DDL for this table. The primary key is TEXT; other columns carry no
    /// affinity on purpose.
    pub fn create_sql(&self) -> String {
        let mut cols = vec![format!("{} TEXT PRIMARY KEY", self.pk)];
        cols.extend(self.columns.iter().map(|c| format!("\"{c}\"")));
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.name,
            cols.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tables_resolve() {
        assert!(is_syncable("meetings"));
        assert!(is_syncable("topic_meetings"));
        assert!(!is_syncable("sync_changelog"));
        assert!(!is_syncable("dropped_table"));
    }

    #[test]
    fn spec_knows_columns() {
        let spec = table_spec("meetings").unwrap();
        assert_eq!(spec.pk, "id");
        assert!(spec.has_column("title"));
        assert!(!spec.has_column("id"));
        assert!(!spec.has_column("nonexistent"));
    }

    #[test]
    fn create_sql_is_well_formed() {
        for spec in SYNCABLE_TABLES {
            let sql = spec.create_sql();
            assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS"));
            assert!(sql.contains("TEXT PRIMARY KEY"));
        }
    }

    #[test]
    fn no_duplicate_table_names() {
        let mut names: Vec<_> = SYNCABLE_TABLES.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SYNCABLE_TABLES.len());
    }
}
