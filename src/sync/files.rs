//! Tracks non-row files (knowledge-graph export, memory tiers, audio).
//!
//! Files are content-addressed by SHA-256. A hash change clears the
//! manifest's upload state; the next push re-uploads under the new hash.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::storage::{new_row_id, FileManifestRow, Store};

/// Streaming SHA-256 of a file, hex-encoded.
pub fn compute_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Detects content changes in tracked files and maintains their manifest
/// rows. The caller (the sync engine's pre-push scan) schedules uploads.
pub struct FileTracker<'a> {
    store: &'a Store,
}

impl<'a> FileTracker<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Check one file. Returns `None` when the file is missing or its
    /// content hash is unchanged; otherwise the manifest row was created
    /// or updated with cleared upload state and is returned.
    pub fn check_file(&self, path: &Path, file_type: &str) -> Result<Option<FileManifestRow>> {
        if !path.exists() {
            return Ok(None);
        }

        let content_hash = compute_hash(path)?;
        let size_bytes = std::fs::metadata(path)?.len();
        let path_str = path.to_string_lossy().into_owned();

        let existing = self.store.manifest_for(&path_str, file_type)?;
        if let Some(row) = &existing {
            if row.content_hash == content_hash {
                return Ok(None);
            }
        }

        let row = FileManifestRow {
            id: existing.map(|r| r.id).unwrap_or_else(new_row_id),
            file_type: file_type.to_string(),
            file_path: path_str,
            content_hash,
            size_bytes,
            cloud_key: None,
            synced_at: None,
        };
        self.store.upsert_manifest(&row)?;
        tracing::debug!(
            file_type,
            path = %row.file_path,
            hash = %row.content_hash,
            "File changed, upload pending"
        );
        Ok(Some(row))
    }
}
