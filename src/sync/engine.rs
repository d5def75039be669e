//! High-level sync engine: device identity, lifecycle, auto-sync loop.
//!
//! Lifecycle: [`SyncEngine::initialize`] → [`SyncEngine::setup_encryption`]
//! → [`SyncEngine::sync_now`] (or [`SyncEngine::initial_clone`] on a fresh
//! device). The engine is a value owned by the application root and
//! threaded to consumers by reference; nothing here is a global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::error::{Result, SyncError};
use crate::security::crypto::EncryptionService;
use crate::security::vault::Vault;
use crate::storage::{ChangeLogEntry, DeviceKind, DeviceRow, Store};
use crate::sync::changelog::{ChangeTracker, TrackedWrites};
use crate::sync::clock::HybridLogicalClock;
use crate::sync::cloud::{CloudClient, ObjectStore};
use crate::sync::files::FileTracker;
use crate::sync::protocol::{PullStats, PushStats, SyncProtocol};

/// Hook invoked after an initial clone so the host can rebuild derived
/// indexes (e.g. a vector store) from the freshly-synced rows. The sync
/// core itself performs no indexing.
pub type RebuildHook = Box<dyn Fn(&Store) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub push: PushStats,
    pub pull: PullStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupOutcome {
    pub action: String,
    pub key_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub initialized: bool,
    pub device_id: String,
    pub vault_unlocked: bool,
    pub online: bool,
    pub auto_sync_running: bool,
    pub sync_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovedDevice {
    pub device_id: String,
    pub cloud_objects_deleted: usize,
}

struct AutoSync {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SyncEngine {
    settings: Settings,
    store: Store,
    vault: Arc<Vault>,
    clock: Arc<HybridLogicalClock>,
    tracker: Arc<ChangeTracker>,
    cloud: CloudClient,
    protocol: SyncProtocol,
    device: DeviceRow,
    sync_lock: tokio::sync::Mutex<()>,
    online: AtomicBool,
    auto_sync: parking_lot::Mutex<Option<AutoSync>>,
    rebuild_hook: parking_lot::Mutex<Option<RebuildHook>>,
}

impl SyncEngine {
    /// Load or create the device identity and wire up all components.
    pub fn initialize(
        settings: Settings,
        vault: Arc<Vault>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Arc<Self>> {
        settings.ensure_dirs()?;
        let store = Store::open(&settings.db_path())?;

        let device = match store.current_device()? {
            Some(device) => {
                tracing::info!(device_id = %device.id, name = %device.name, "Loaded existing device");
                device
            }
            None => {
                let device = DeviceRow {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: settings
                        .device_name
                        .clone()
                        .unwrap_or_else(|| "unknown".into()),
                    kind: DeviceKind::Desktop,
                    last_sync_at: None,
                    is_current: true,
                    created_at: crate::storage::now_rfc3339(),
                };
                store.insert_device(&device)?;
                tracing::info!(device_id = %device.id, name = %device.name, "Created new device");
                device
            }
        };

        let clock = Arc::new(HybridLogicalClock::new(device.id.clone()));
        let tracker = Arc::new(ChangeTracker::new(Arc::clone(&clock), device.id.clone()));
        let crypto = Arc::new(EncryptionService::new(Arc::clone(&vault)));
        let cloud = CloudClient::new(object_store, settings.user_id.clone());
        let protocol = SyncProtocol::new(
            Arc::clone(&clock),
            cloud.clone(),
            crypto,
            Arc::clone(&tracker),
            device.id.clone(),
            settings.files_dir(),
        );

        Ok(Arc::new(Self {
            settings,
            store,
            vault,
            clock,
            tracker,
            cloud,
            protocol,
            device,
            sync_lock: tokio::sync::Mutex::new(()),
            online: AtomicBool::new(true),
            auto_sync: parking_lot::Mutex::new(None),
            rebuild_hook: parking_lot::Mutex::new(None),
        }))
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clock(&self) -> &Arc<HybridLogicalClock> {
        &self.clock
    }

    /// The sanctioned write path for host-application mutations.
    pub fn tracked_writes(&self) -> TrackedWrites<'_> {
        TrackedWrites::new(&self.store, &self.tracker)
    }

    // ── Encryption setup ────────────────────────────────────────

    /// First call sets the vault up; later calls unlock it. Argon2 runs on
    /// the blocking pool so the async loop is never stalled by the KDF.
    pub async fn setup_encryption(&self, passphrase: &str) -> Result<SetupOutcome> {
        let vault = Arc::clone(&self.vault);
        let passphrase = passphrase.to_string();
        let (action, info) = tokio::task::spawn_blocking(move || {
            if vault.is_initialized() {
                vault.unlock(&passphrase).map(|info| ("unlocked", info))
            } else {
                vault.setup(&passphrase).map(|info| ("initialized", info))
            }
        })
        .await
        .map_err(|e| SyncError::StateConflict(format!("vault task failed: {e}")))??;

        if let Err(e) = self.cloud.ensure_bucket().await {
            tracing::warn!(error = %e, "Could not ensure sync bucket, will retry on sync");
        }

        Ok(SetupOutcome {
            action: action.to_string(),
            key_id: info.key_id,
        })
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    // ── Sync ────────────────────────────────────────────────────

    /// File scan → push → pull → housekeeping, serialized by the sync
    /// lock. Not mid-step cancellable; object-store idempotency makes a
    /// retried cycle safe.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        if !self.vault.is_unlocked() {
            return Err(SyncError::VaultLocked);
        }
        let _lock = self.sync_lock.lock().await;

        self.scan_tracked_files()?;
        let push = self.protocol.push(&self.store).await?;
        let pull = self.protocol.pull(&self.store).await?;
        self.protocol
            .prune_changelog(&self.store, self.settings.changelog_retention_days)?;
        self.store.touch_device_last_sync(&self.device.id)?;

        Ok(SyncReport { push, pull })
    }

    /// Check every trackable file for content changes before a push.
    fn scan_tracked_files(&self) -> Result<()> {
        let tracker = FileTracker::new(&self.store);

        let kg = self.settings.knowledge_graph_path();
        tracker.check_file(&kg, "knowledge_graph")?;

        for tier in ["short_term", "medium_term", "long_term"] {
            let path = self.settings.memory_dir().join(format!("{tier}.md"));
            tracker.check_file(&path, &format!("memory_{tier}"))?;
        }

        if self.settings.audio_sync_enabled {
            let audio_paths: Vec<String> = self.store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT compressed_audio_path FROM meetings
                     WHERE compressed_audio_path IS NOT NULL",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut paths = Vec::new();
                for row in rows {
                    paths.push(row?);
                }
                Ok(paths)
            })?;
            for path in audio_paths {
                tracker.check_file(std::path::Path::new(&path), "audio")?;
            }
        }
        Ok(())
    }

    // ── Initial clone ───────────────────────────────────────────

    /// Full data download for a device that just joined the mesh: a pull
    /// with all cursors at zero, then the host's index-rebuild hook.
    pub async fn initial_clone(&self) -> Result<PullStats> {
        if !self.vault.is_unlocked() {
            return Err(SyncError::VaultLocked);
        }
        let _lock = self.sync_lock.lock().await;

        let stats = self.protocol.pull(&self.store).await?;

        if let Some(hook) = self.rebuild_hook.lock().as_ref() {
            hook(&self.store);
        }

        tracing::info!(
            received = stats.received,
            applied = stats.applied,
            files = stats.files,
            "Initial clone complete"
        );
        Ok(stats)
    }

    /// Install the post-clone index rebuild callback.
    pub fn set_rebuild_hook(&self, hook: RebuildHook) {
        *self.rebuild_hook.lock() = Some(hook);
    }

    // ── Auto-sync loop ──────────────────────────────────────────

    pub fn start_auto_sync(self: &Arc<Self>) {
        let mut slot = self.auto_sync.lock();
        if slot.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let interval = Duration::from_secs(self.settings.sync_interval_seconds.max(1));
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        if engine.is_online() && engine.vault.is_unlocked() {
                            if let Err(e) = engine.sync_now().await {
                                tracing::warn!(error = %e, "Auto-sync cycle failed");
                            }
                        }
                    }
                }
            }
            tracing::info!("Auto-sync loop stopped");
        });

        *slot = Some(AutoSync { shutdown, handle });
        tracing::info!(
            interval_seconds = self.settings.sync_interval_seconds,
            "Auto-sync started"
        );
    }

    /// Signal the loop and wait for any in-flight cycle to finish.
    pub async fn stop_auto_sync(&self) {
        let auto_sync = self.auto_sync.lock().take();
        if let Some(auto_sync) = auto_sync {
            let _ = auto_sync.shutdown.send(true);
            let _ = auto_sync.handle.await;
        }
    }

    pub fn auto_sync_running(&self) -> bool {
        self.auto_sync.lock().is_some()
    }

    // ── Connectivity ────────────────────────────────────────────

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Update connectivity. An offline→online transition with an unlocked
    /// vault triggers an immediate sync; its report is returned.
    pub async fn set_online(&self, online: bool) -> Result<Option<SyncReport>> {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online && self.vault.is_unlocked() {
            tracing::info!("Back online, triggering sync");
            return self.sync_now().await.map(Some);
        }
        Ok(None)
    }

    // ── Status / device management ──────────────────────────────

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            initialized: true,
            device_id: self.device.id.clone(),
            vault_unlocked: self.vault.is_unlocked(),
            online: self.is_online(),
            auto_sync_running: self.auto_sync_running(),
            sync_interval_seconds: self.settings.sync_interval_seconds,
        }
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRow>> {
        self.store.list_devices()
    }

    /// Remove a device: delete its remote changelog, then the local row.
    /// The current device cannot be removed.
    pub async fn remove_device(&self, device_id: &str) -> Result<RemovedDevice> {
        if device_id == self.device.id {
            return Err(SyncError::BadRequest(
                "cannot remove the current device".into(),
            ));
        }
        if self.store.device_by_id(device_id)?.is_none() {
            return Err(SyncError::BadRequest(format!(
                "device not found: {device_id}"
            )));
        }

        let deleted = match self.cloud.delete_device_data(device_id).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(device_id, error = %e, "Could not clean cloud data for device");
                0
            }
        };
        self.store.delete_device(device_id)?;

        Ok(RemovedDevice {
            device_id: device_id.to_string(),
            cloud_objects_deleted: deleted,
        })
    }

    /// Recent changelog entries (debug surface).
    pub fn changelog(&self, limit: u32, table: Option<&str>) -> Result<Vec<ChangeLogEntry>> {
        self.store.recent_changelog(limit, table)
    }
}
