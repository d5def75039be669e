//! Vault and encryption primitives.
//!
//! The vault derives the session key from the user's passphrase; the
//! encryption service seals everything that leaves the device with
//! AES-256-GCM. No key material, passphrase, or plaintext ever reaches
//! the object store.

pub mod crypto;
pub mod vault;

pub use crypto::EncryptionService;
pub use vault::Vault;
