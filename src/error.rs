//! Error sum type for the sync core.
//!
//! Every fallible operation in the library returns [`SyncError`]; the CLI
//! binary converts to `anyhow` at the edge. The variants map onto the
//! user-visible failure classes: vault state, crypto integrity, network,
//! schema drift, and caller mistakes.

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("vault is not initialized")]
    VaultNotInitialized,

    #[error("vault is locked")]
    VaultLocked,

    #[error("invalid passphrase")]
    InvalidPassphrase,

    #[error("vault is already initialized")]
    AlreadyInitialized,

    /// Malformed ciphertext, container, or envelope. Distinct from
    /// [`SyncError::AuthFailed`]: the data could not even be parsed.
    #[error("corrupt encrypted data: {0}")]
    Corrupt(String),

    /// AEAD authentication failure (wrong key, flipped bits, reordered
    /// chunks). Never recovered silently.
    #[error("decryption failed: authentication tag mismatch")]
    AuthFailed,

    /// Transient object-store failure. The auto-sync loop retries on its
    /// next tick.
    #[error("object store error: {0}")]
    Network(String),

    /// A remote entry references a table this device does not know.
    /// Logged and skipped for forward compatibility.
    #[error("unknown table: {0}")]
    SchemaUnknown(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Network(e.to_string())
    }
}
