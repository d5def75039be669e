//! Multi-device synchronization core.
//!
//! Local mutations flow through the tracked write adapter, which stamps
//! each row change with a hybrid logical clock timestamp. The protocol
//! pushes encrypted changelog batches and content-addressed files to an
//! untrusted object store, pulls what peers pushed, resolves conflicts
//! deterministically, and applies entries idempotently with tracking
//! suppressed. The engine owns device identity and the auto-sync loop.

pub mod changelog;
pub mod clock;
pub mod cloud;
pub mod conflict;
pub mod engine;
pub mod files;
pub mod protocol;

pub use engine::SyncEngine;
