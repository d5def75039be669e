//! End-to-end encrypted multi-device sync core for the LIME personal
//! knowledge system.
//!
//! Each device holds a local SQLite store, a set of content-addressed
//! files, and a shared passphrase-derived key. This crate replicates that
//! state across devices through an untrusted S3-compatible object store:
//! the server sees only ciphertext and a key layout, and cannot tamper
//! with data without failing authentication on a peer.
//!
//! ## Architecture
//!
//! - [`security::vault`] — passphrase-derived key lifecycle (Argon2id,
//!   HMAC verification token, idle timeout)
//! - [`security::crypto`] — AES-256-GCM for bytes, JSON, envelopes, and
//!   chunked file containers
//! - [`sync::clock`] — hybrid logical clock for causal ordering without
//!   wall-clock agreement
//! - [`sync::changelog`] — per-row change tracking through a write
//!   adapter, suppressible during remote apply
//! - [`sync::files`] — SHA-256 manifests for tracked non-row files
//! - [`sync::cloud`] — the object-store seam (SigV4 S3 client and an
//!   in-memory double)
//! - [`sync::conflict`] — deterministic conflict resolution
//! - [`sync::protocol`] — push/pull orchestration with per-peer cursors
//! - [`sync::engine`] — device identity, lifecycle, auto-sync loop
//! - [`storage`] — the local relational store and syncable-table registry

pub mod config;
pub mod error;
pub mod security;
pub mod storage;
pub mod sync;

pub use config::Settings;
pub use error::{Result, SyncError};
pub use security::{EncryptionService, Vault};
pub use sync::SyncEngine;
