//! Environment-driven configuration.
//!
//! All knobs are read once at startup from `LIME_*` environment variables
//! with code defaults, and the resulting [`Settings`] value is threaded to
//! the components that need it. No global state.

use std::env;
use std::path::{Path, PathBuf};

/// Runtime configuration for the sync core.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for the local store, vault file, and file caches.
    pub data_dir: PathBuf,
    /// Human-readable device name override (defaults to `$HOSTNAME`).
    pub device_name: Option<String>,

    // S3-compatible object store
    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_bucket: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    /// Per-user key namespace; every object key is prefixed `{user_id}/`.
    pub user_id: String,

    // Argon2id tuning. These are part of the vault wire format; changing
    // them invalidates existing vault files on other devices.
    pub argon2_time_cost: u32,
    pub argon2_memory_kib: u32,
    pub argon2_parallelism: u32,

    /// Idle minutes before the vault session key is wiped.
    pub session_timeout_minutes: u64,
    /// Seconds between auto-sync cycles.
    pub sync_interval_seconds: u64,
    /// Whether compressed meeting audio participates in file sync.
    pub audio_sync_enabled: bool,
    /// Days to keep already-pushed changelog entries before pruning.
    pub changelog_retention_days: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            device_name: None,
            s3_endpoint: "http://127.0.0.1:9000".into(),
            s3_region: "us-east-1".into(),
            s3_bucket: "lime-sync".into(),
            s3_access_key: String::new(),
            s3_secret_key: String::new(),
            user_id: "default".into(),
            argon2_time_cost: 3,
            argon2_memory_kib: 64 * 1024,
            argon2_parallelism: 4,
            session_timeout_minutes: 30,
            sync_interval_seconds: 300,
            audio_sync_enabled: false,
            changelog_retention_days: 30,
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Settings::default();
        Settings {
            data_dir: env_var("LIME_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            device_name: env_var("LIME_DEVICE_NAME").or_else(|| env_var("HOSTNAME")),
            s3_endpoint: env_var("LIME_S3_ENDPOINT").unwrap_or(d.s3_endpoint),
            s3_region: env_var("LIME_S3_REGION").unwrap_or(d.s3_region),
            s3_bucket: env_var("LIME_S3_BUCKET").unwrap_or(d.s3_bucket),
            s3_access_key: env_var("LIME_S3_ACCESS_KEY").unwrap_or(d.s3_access_key),
            s3_secret_key: env_var("LIME_S3_SECRET_KEY").unwrap_or(d.s3_secret_key),
            user_id: env_var("LIME_USER_ID").unwrap_or(d.user_id),
            argon2_time_cost: env_parsed("LIME_ARGON2_TIME_COST", d.argon2_time_cost),
            argon2_memory_kib: env_parsed("LIME_ARGON2_MEMORY_KIB", d.argon2_memory_kib),
            argon2_parallelism: env_parsed("LIME_ARGON2_PARALLELISM", d.argon2_parallelism),
            session_timeout_minutes: env_parsed(
                "LIME_SESSION_TIMEOUT_MINUTES",
                d.session_timeout_minutes,
            ),
            sync_interval_seconds: env_parsed(
                "LIME_SYNC_INTERVAL_SECONDS",
                d.sync_interval_seconds,
            ),
            audio_sync_enabled: env_parsed("LIME_AUDIO_SYNC_ENABLED", d.audio_sync_enabled),
            changelog_retention_days: env_parsed(
                "LIME_CHANGELOG_RETENTION_DAYS",
                d.changelog_retention_days,
            ),
        }
    }

    /// SQLite database path.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("lime.db")
    }

    /// Vault file (salt + verification token, no key material).
    pub fn vault_path(&self) -> PathBuf {
        self.data_dir.join("vault.json")
    }

    /// Memory tier files (`short_term.md`, `medium_term.md`, `long_term.md`).
    pub fn memory_dir(&self) -> PathBuf {
        self.data_dir.join("memory")
    }

    /// Exported knowledge-graph snapshot.
    pub fn knowledge_graph_path(&self) -> PathBuf {
        self.data_dir.join("exports").join("knowledge_graph.json")
    }

    /// Content-addressed cache for files restored from the object store.
    pub fn files_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }

    /// Create the on-disk directory layout if absent.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.data_dir.join("db"),
            self.memory_dir(),
            self.data_dir.join("exports"),
            self.files_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Settings rooted at an arbitrary directory (used by tests).
    pub fn with_data_dir(dir: &Path) -> Self {
        Settings {
            data_dir: dir.to_path_buf(),
            ..Settings::default()
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_var(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, raw = %raw, "Unparseable env value, using default");
            default
        }),
        None => default,
    }
}
