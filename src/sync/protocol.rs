//! Push/pull sync orchestration.
//!
//! Push: select unpushed changelog entries → batch → encrypt → upload,
//! then upload pending files content-addressed, then advance the push
//! watermark. Pull: enumerate peers → list batches past the cursor →
//! download → decrypt → resolve conflicts → apply idempotently with the
//! change tracker suppressed, advancing the cursor in the same
//! transaction as the applied writes.
//!
//! Push runs before pull within a cycle, so local work is shared before a
//! conflicting remote entry with a smaller HLC can override it.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::error::{Result, SyncError};
use crate::security::crypto::{EncryptionService, SyncEnvelope};
use crate::storage::{self, ChangeLogEntry, FileManifestRow, Store};
use crate::sync::changelog::ChangeTracker;
use crate::sync::clock::HybridLogicalClock;
use crate::sync::cloud::CloudClient;
use crate::sync::conflict::{ConflictResolver, ResolutionStrategy};

/// Maximum changelog entries per uploaded batch.
pub const MAX_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PushStats {
    pub batches: usize,
    pub entries: usize,
    pub files: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PullStats {
    pub received: usize,
    pub applied: usize,
    pub conflicts: usize,
    pub files: usize,
}

pub struct SyncProtocol {
    clock: Arc<HybridLogicalClock>,
    cloud: CloudClient,
    crypto: Arc<EncryptionService>,
    tracker: Arc<ChangeTracker>,
    resolver: ConflictResolver,
    device_id: String,
    /// Content-addressed cache for files restored from peers.
    files_dir: PathBuf,
}

impl SyncProtocol {
    pub fn new(
        clock: Arc<HybridLogicalClock>,
        cloud: CloudClient,
        crypto: Arc<EncryptionService>,
        tracker: Arc<ChangeTracker>,
        device_id: impl Into<String>,
        files_dir: PathBuf,
    ) -> Self {
        Self {
            clock,
            cloud,
            crypto,
            tracker,
            resolver: ConflictResolver::new(),
            device_id: device_id.into(),
            files_dir,
        }
    }

    // ── Push ────────────────────────────────────────────────────

    pub async fn push(&self, store: &Store) -> Result<PushStats> {
        let state = store.sync_state(&self.device_id)?;
        let entries = store.unpushed_entries(&self.device_id, state.last_pushed_hlc.as_deref())?;

        let mut stats = PushStats::default();
        for batch in entries.chunks(MAX_BATCH_SIZE) {
            let payload = serde_json::to_vec(batch)?;
            let encrypted = self.crypto.encrypt_bytes(&payload)?;
            let last = batch.last().expect("chunks are non-empty");
            let batch_id = format!("{}_{}", last.hlc_timestamp, random_suffix());
            self.cloud
                .upload_changelog_batch(&self.device_id, &batch_id, encrypted)
                .await?;
            stats.batches += 1;
            stats.entries += batch.len();
        }

        stats.files = self.push_files(store).await?;

        // A failed upload above leaves the watermark unchanged; the next
        // sync replays the same entries (idempotent apply on the peer).
        if let Some(last) = entries.last() {
            store.set_last_pushed(&self.device_id, &last.hlc_timestamp.to_string())?;
        }

        if stats.batches > 0 || stats.files > 0 {
            tracing::info!(
                batches = stats.batches,
                entries = stats.entries,
                files = stats.files,
                "Push complete"
            );
        }
        Ok(stats)
    }

    /// Upload every manifest with pending state, content-addressed with
    /// HEAD-first dedup. Per-file failures are logged and skipped; the
    /// manifest stays pending for the next cycle.
    async fn push_files(&self, store: &Store) -> Result<usize> {
        let pending = store.pending_manifests()?;
        let mut pushed = 0;
        for manifest in pending {
            match self.push_one_file(store, &manifest).await {
                Ok(true) => pushed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(path = %manifest.file_path, error = %e, "File push failed");
                }
            }
        }
        if pushed > 0 {
            self.upload_aggregate_manifest(store).await?;
        }
        Ok(pushed)
    }

    async fn push_one_file(&self, store: &Store, manifest: &FileManifestRow) -> Result<bool> {
        let path = std::path::Path::new(&manifest.file_path);
        if !path.exists() {
            return Ok(false);
        }
        let container = self.crypto.encrypt_file_to_vec(path)?;
        self.cloud
            .upload_file(&manifest.content_hash, container)
            .await?;
        store.mark_manifest_synced(&manifest.id, &manifest.content_hash)?;
        Ok(true)
    }

    /// Publish the full manifest table as an encrypted envelope so peers
    /// can discover which content hashes exist and restore them.
    async fn upload_aggregate_manifest(&self, store: &Store) -> Result<()> {
        let rows = store.all_manifests()?;
        let value = serde_json::to_value(&rows)?;
        let envelope = self.crypto.encrypt_sync_payload(&value)?;
        self.cloud
            .upload_manifest(serde_json::to_vec(&envelope)?)
            .await
    }

    // ── Pull ────────────────────────────────────────────────────

    pub async fn pull(&self, store: &Store) -> Result<PullStats> {
        let mut stats = PullStats::default();
        let remote_devices = self.cloud.list_devices().await?;

        for remote_id in remote_devices {
            if remote_id == self.device_id {
                continue;
            }

            let state = store.sync_state(&remote_id)?;
            let cursor = state.last_pulled_hlc;
            let batches = self.cloud.list_changelog_batches(&remote_id).await?;

            for batch_id in batches
                .iter()
                .filter(|b| cursor.as_deref().is_none_or(|c| b.as_str() > c))
            {
                let encrypted = self
                    .cloud
                    .download_changelog_batch(&remote_id, batch_id)
                    .await?;

                // A batch that fails authentication or parsing is skipped;
                // later batches from the same device are still attempted.
                let entries = match self.decode_batch(&encrypted) {
                    Ok(entries) => entries,
                    Err(e @ (SyncError::AuthFailed | SyncError::Corrupt(_))) => {
                        tracing::error!(
                            device = %remote_id,
                            batch = %batch_id,
                            error = %e,
                            "Undecryptable changelog batch, skipping"
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                stats.received += entries.len();
                let (applied, conflicts) =
                    self.apply_batch(store, &remote_id, batch_id, &entries)?;
                stats.applied += applied;
                stats.conflicts += conflicts;
            }

            if store.device_by_id(&remote_id)?.is_some() {
                store.touch_device_last_sync(&remote_id)?;
            }
        }

        stats.files = self.pull_files(store).await?;

        if stats.received > 0 || stats.files > 0 {
            tracing::info!(
                received = stats.received,
                applied = stats.applied,
                conflicts = stats.conflicts,
                files = stats.files,
                "Pull complete"
            );
        }
        Ok(stats)
    }

    fn decode_batch(&self, encrypted: &[u8]) -> Result<Vec<ChangeLogEntry>> {
        let payload = self.crypto.decrypt_bytes(encrypted)?;
        serde_json::from_slice(&payload)
            .map_err(|e| SyncError::Corrupt(format!("unparseable batch: {e}")))
    }

    /// Apply one decrypted batch. All row writes and the cursor advance
    /// share a transaction, and the tracker is suppressed for its whole
    /// scope so applied rows are never re-logged.
    fn apply_batch(
        &self,
        store: &Store,
        remote_id: &str,
        batch_id: &str,
        entries: &[ChangeLogEntry],
    ) -> Result<(usize, usize)> {
        let _suppressed = self.tracker.suppress();
        store.with_tx(|conn| {
            let mut applied = 0;
            let mut conflicts = 0;

            for entry in entries {
                // Our clock must end up strictly ahead of every observed
                // timestamp.
                self.clock.receive(&entry.hlc_timestamp);

                let mut entry = entry.clone();
                let local = storage::find_local_conflict(
                    conn,
                    &entry.entity_table,
                    &entry.entity_id,
                    &self.device_id,
                    &entry.hlc_timestamp.to_string(),
                )?;

                if let Some(local) = local {
                    conflicts += 1;
                    let resolution = self.resolver.resolve(&local, &entry);
                    tracing::info!(
                        table = %entry.entity_table,
                        entity = %entry.entity_id,
                        strategy = ?resolution.strategy,
                        details = %resolution.details,
                        "Conflict resolved"
                    );
                    match resolution.strategy {
                        ResolutionStrategy::LocalWins | ResolutionStrategy::DeleteWins => {
                            continue;
                        }
                        ResolutionStrategy::Merge => {
                            entry.changed_fields = resolution.merged_fields;
                        }
                        ResolutionStrategy::RemoteWins => {}
                    }
                }

                match storage::apply_remote_entry(conn, &entry) {
                    Ok(_) => applied += 1,
                    Err(SyncError::SchemaUnknown(table)) => {
                        tracing::warn!(table = %table, "Remote entry for unknown table, skipping");
                    }
                    Err(e) => return Err(e),
                }
            }

            storage::set_last_pulled(conn, remote_id, batch_id)?;
            Ok((applied, conflicts))
        })
    }

    /// Restore content-addressed files listed in the remote aggregate
    /// manifest into the local file cache. Failures abort the file phase
    /// only, never the entry pull that already committed.
    async fn pull_files(&self, store: &Store) -> Result<usize> {
        let Some(raw) = self.cloud.download_manifest().await? else {
            return Ok(0);
        };
        let envelope: SyncEnvelope = match serde_json::from_slice(&raw) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable aggregate manifest, skipping file pull");
                return Ok(0);
            }
        };
        let value = match self.crypto.decrypt_sync_payload(&envelope) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Undecryptable aggregate manifest, skipping file pull");
                return Ok(0);
            }
        };
        let rows: Vec<FileManifestRow> = match serde_json::from_value(value) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed aggregate manifest, skipping file pull");
                return Ok(0);
            }
        };

        std::fs::create_dir_all(&self.files_dir)?;
        let mut restored = 0;
        for row in rows {
            if store.knows_file_hash(&row.content_hash)? {
                continue;
            }
            let cache_path = self.files_dir.join(&row.content_hash);
            if cache_path.exists() {
                continue;
            }
            let Some(container) = self.cloud.download_file(&row.content_hash).await? else {
                tracing::warn!(hash = %row.content_hash, "Manifest references missing file");
                continue;
            };
            let plaintext = match self.crypto.decrypt_container(&container) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(hash = %row.content_hash, error = %e, "Undecryptable file");
                    continue;
                }
            };
            std::fs::write(&cache_path, plaintext)?;

            let restored_row = FileManifestRow {
                id: storage::new_row_id(),
                file_type: row.file_type.clone(),
                file_path: cache_path.to_string_lossy().into_owned(),
                content_hash: row.content_hash.clone(),
                size_bytes: row.size_bytes,
                cloud_key: None,
                synced_at: None,
            };
            store.upsert_manifest(&restored_row)?;
            store.mark_manifest_synced(&restored_row.id, &row.content_hash)?;
            restored += 1;
        }
        Ok(restored)
    }

    // ── Retention ───────────────────────────────────────────────

    /// Delete local changelog entries that are both older than the
    /// retention window and already covered by the push watermark.
    pub fn prune_changelog(&self, store: &Store, retention_days: u64) -> Result<usize> {
        let state = store.sync_state(&self.device_id)?;
        let Some(watermark) = state.last_pushed_hlc else {
            return Ok(0);
        };
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64)).to_rfc3339();
        let pruned = store.prune_changelog(&self.device_id, &cutoff, &watermark)?;
        if pruned > 0 {
            tracing::info!(pruned, retention_days, "Pruned changelog");
        }
        Ok(pruned)
    }
}

fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
