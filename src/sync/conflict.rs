//! Conflict classification and resolution.
//!
//! A conflict exists when a pulled remote entry touches an entity that a
//! local entry (from this device) also touched at an HLC at or above the
//! remote's. Resolution is deterministic on both sides, so two devices
//! that exchange the same entries always converge:
//!
//! - a local DELETE beats anything (`DeleteWins` — remote skipped)
//! - a remote DELETE always applies (`RemoteWins`)
//! - disjoint field sets merge; overlapping sets fall back to
//!   last-writer-wins on the full HLC order, which embeds the
//!   lexicographic `node_id` tie-break

use serde::Serialize;

use crate::storage::{ChangeLogEntry, ChangeOperation, FieldMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LocalWins,
    RemoteWins,
    DeleteWins,
    Merge,
}

/// Outcome of resolving one conflict. `merged_fields` is set only for
/// [`ResolutionStrategy::Merge`] and replaces the remote entry's
/// `changed_fields` before apply.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub merged_fields: Option<FieldMap>,
    pub details: String,
}

pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, local: &ChangeLogEntry, remote: &ChangeLogEntry) -> Resolution {
        // Deletes dominate regardless of timestamps.
        if local.operation == ChangeOperation::Delete {
            return Resolution {
                strategy: ResolutionStrategy::DeleteWins,
                merged_fields: None,
                details: format!(
                    "local delete at {} beats remote {}",
                    local.hlc_timestamp, remote.operation
                ),
            };
        }
        if remote.operation == ChangeOperation::Delete {
            return Resolution {
                strategy: ResolutionStrategy::RemoteWins,
                merged_fields: None,
                details: format!(
                    "remote delete at {} beats local {}",
                    remote.hlc_timestamp, local.operation
                ),
            };
        }

        // Both sides are INSERT/UPDATE. Disjoint field sets can both win.
        let local_fields = local.changed_fields.clone().unwrap_or_default();
        let remote_fields = remote.changed_fields.clone().unwrap_or_default();
        let overlapping: Vec<&str> = remote_fields
            .keys()
            .filter(|k| local_fields.contains_key(*k))
            .map(|k| k.as_str())
            .collect();

        if overlapping.is_empty() {
            let mut merged = local_fields;
            for (key, value) in remote_fields {
                merged.insert(key, value);
            }
            return Resolution {
                strategy: ResolutionStrategy::Merge,
                merged_fields: Some(merged),
                details: "disjoint field sets merged".into(),
            };
        }

        // Same fields touched on both sides: last writer wins. The HLC
        // total order breaks wall-clock ties by counter, then node_id.
        if remote.hlc_timestamp > local.hlc_timestamp {
            Resolution {
                strategy: ResolutionStrategy::RemoteWins,
                merged_fields: None,
                details: format!(
                    "remote {} > local {} on {:?}",
                    remote.hlc_timestamp, local.hlc_timestamp, overlapping
                ),
            }
        } else {
            Resolution {
                strategy: ResolutionStrategy::LocalWins,
                merged_fields: None,
                details: format!(
                    "local {} ≥ remote {} on {:?}",
                    local.hlc_timestamp, remote.hlc_timestamp, overlapping
                ),
            }
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::new_row_id;
    use crate::sync::clock::HlcTimestamp;
    use serde_json::json;

    fn entry(
        op: ChangeOperation,
        hlc: HlcTimestamp,
        fields: &[(&str, serde_json::Value)],
    ) -> ChangeLogEntry {
        let map: FieldMap = fields
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        ChangeLogEntry {
            id: new_row_id(),
            device_id: hlc.node_id.clone(),
            hlc_timestamp: hlc,
            entity_table: "meetings".into(),
            entity_id: "m1".into(),
            operation: op,
            changed_fields: if map.is_empty() { None } else { Some(map) },
        }
    }

    #[test]
    fn local_delete_wins() {
        let resolver = ConflictResolver::new();
        let local = entry(
            ChangeOperation::Delete,
            HlcTimestamp::new(1005, 0, "nodeA"),
            &[],
        );
        let remote = entry(
            ChangeOperation::Update,
            HlcTimestamp::new(1004, 0, "nodeB"),
            &[("title", json!("late edit"))],
        );
        let r = resolver.resolve(&local, &remote);
        assert_eq!(r.strategy, ResolutionStrategy::DeleteWins);
        assert!(r.merged_fields.is_none());
    }

    #[test]
    fn remote_delete_wins() {
        let resolver = ConflictResolver::new();
        let local = entry(
            ChangeOperation::Update,
            HlcTimestamp::new(1010, 0, "nodeA"),
            &[("title", json!("local edit"))],
        );
        let remote = entry(
            ChangeOperation::Delete,
            HlcTimestamp::new(1005, 0, "nodeB"),
            &[],
        );
        let r = resolver.resolve(&local, &remote);
        assert_eq!(r.strategy, ResolutionStrategy::RemoteWins);
    }

    #[test]
    fn disjoint_fields_merge_keeps_both() {
        let resolver = ConflictResolver::new();
        let local = entry(
            ChangeOperation::Update,
            HlcTimestamp::new(1002, 0, "nodeA"),
            &[("title", json!("local title"))],
        );
        let remote = entry(
            ChangeOperation::Update,
            HlcTimestamp::new(1001, 0, "nodeB"),
            &[("sentiment", json!("positive"))],
        );
        let r = resolver.resolve(&local, &remote);
        assert_eq!(r.strategy, ResolutionStrategy::Merge);
        let merged = r.merged_fields.unwrap();
        assert_eq!(merged["title"], json!("local title"));
        assert_eq!(merged["sentiment"], json!("positive"));
    }

    #[test]
    fn overlapping_fields_last_writer_wins() {
        let resolver = ConflictResolver::new();
        let local = entry(
            ChangeOperation::Update,
            HlcTimestamp::new(1002, 0, "nodeA"),
            &[("title", json!("mine"))],
        );
        let remote = entry(
            ChangeOperation::Update,
            HlcTimestamp::new(1001, 0, "nodeB"),
            &[("title", json!("theirs"))],
        );
        let r = resolver.resolve(&local, &remote);
        assert_eq!(r.strategy, ResolutionStrategy::LocalWins);
    }

    #[test]
    fn equal_wall_and_counter_tie_breaks_on_node_id() {
        // Spec scenario: A writes X, B writes Y at the same instant.
        // nodeB > nodeA lexicographically, so both sides pick B's write.
        let resolver = ConflictResolver::new();

        let a_write = entry(
            ChangeOperation::Update,
            HlcTimestamp::new(1000, 0, "nodeA"),
            &[("title", json!("X"))],
        );
        let b_write = entry(
            ChangeOperation::Update,
            HlcTimestamp::new(1000, 0, "nodeB"),
            &[("title", json!("Y"))],
        );

        // On A: local=a_write, remote=b_write → remote wins.
        let on_a = resolver.resolve(&a_write, &b_write);
        assert_eq!(on_a.strategy, ResolutionStrategy::RemoteWins);

        // On B: local=b_write, remote=a_write → local wins.
        let on_b = resolver.resolve(&b_write, &a_write);
        assert_eq!(on_b.strategy, ResolutionStrategy::LocalWins);
    }

    #[test]
    fn insert_insert_conflict_merges_or_lww() {
        let resolver = ConflictResolver::new();
        let local = entry(
            ChangeOperation::Insert,
            HlcTimestamp::new(1003, 0, "nodeA"),
            &[("title", json!("t")), ("status", json!("recording"))],
        );
        let remote = entry(
            ChangeOperation::Insert,
            HlcTimestamp::new(1001, 0, "nodeB"),
            &[("title", json!("t2"))],
        );
        let r = resolver.resolve(&local, &remote);
        assert_eq!(r.strategy, ResolutionStrategy::LocalWins);
    }
}
