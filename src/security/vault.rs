//! Zero-knowledge passphrase vault.
//!
//! The vault file on disk holds only a random salt, a key id, and an HMAC
//! verification token — never the passphrase or any derived key. The
//! session key lives in memory behind a mutex, is zeroed on lock, and
//! expires after an idle timeout.
//!
//! ## Design
//! - Argon2id key derivation; the parameters are part of the on-disk
//!   format and must match across devices
//! - Verification token `HMAC-SHA256(key, FIXED_PLAINTEXT)` checked in
//!   constant time, so a wrong passphrase is detected without storing
//!   anything an attacker could invert
//! - `change_passphrase` rewrites salt + token atomically while the
//!   session key stays held for continuity

use std::path::PathBuf;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::config::Settings;
use crate::error::{Result, SyncError};

type HmacSha256 = Hmac<Sha256>;

/// Fixed plaintext for the verification token. Stable across versions.
const VERIFICATION_PLAINTEXT: &[u8] = b"LIME-vault-verification-token-v1";

/// Salt length in bytes.
const SALT_LEN: usize = 16;

/// Derived key length in bytes (AES-256).
const KEY_LEN: usize = 32;

/// On-disk vault file. No key material is ever written.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultFile {
    version: u32,
    salt: String,
    key_id: String,
    verification_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_key_id: Option<String>,
}

/// Result of `setup` / `unlock` / `change_passphrase`.
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub key_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_key_id: Option<String>,
}

/// Vault status snapshot for the host surface.
#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub initialized: bool,
    pub unlocked: bool,
    pub key_id: Option<String>,
    pub timeout_minutes: u64,
}

struct Session {
    key: Option<Zeroizing<[u8; KEY_LEN]>>,
    key_id: Option<String>,
    unlocked_at: Option<Instant>,
}

impl Session {
    fn wipe(&mut self) {
        self.key = None; // Zeroizing zeroes the buffer on drop
        self.key_id = None;
        self.unlocked_at = None;
    }
}

/// Manages the passphrase-derived key lifecycle for one user.
pub struct Vault {
    path: PathBuf,
    timeout: Duration,
    argon2_time_cost: u32,
    argon2_memory_kib: u32,
    argon2_parallelism: u32,
    session: Mutex<Session>,
}

impl Vault {
    pub fn new(settings: &Settings) -> Self {
        Self {
            path: settings.vault_path(),
            timeout: Duration::from_secs(settings.session_timeout_minutes * 60),
            argon2_time_cost: settings.argon2_time_cost,
            argon2_memory_kib: settings.argon2_memory_kib,
            argon2_parallelism: settings.argon2_parallelism,
            session: Mutex::new(Session {
                key: None,
                key_id: None,
                unlocked_at: None,
            }),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.path.exists()
    }

    /// True while a session key is held and the idle timeout has not
    /// elapsed. An expired session is wiped as a side effect.
    pub fn is_unlocked(&self) -> bool {
        let mut session = self.session.lock();
        match session.unlocked_at {
            Some(at) if at.elapsed() <= self.timeout => session.key.is_some(),
            Some(_) => {
                session.wipe();
                tracing::info!("Vault session expired, locked");
                false
            }
            None => false,
        }
    }

    pub fn key_id(&self) -> Option<String> {
        self.session.lock().key_id.clone()
    }

    /// Return a defensive copy of the 32-byte session key and touch the
    /// idle timer. Fails with `VaultLocked` when locked or expired.
    pub fn get_key(&self) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let mut session = self.session.lock();
        let expired = matches!(session.unlocked_at, Some(at) if at.elapsed() > self.timeout);
        if expired {
            session.wipe();
        }
        match &session.key {
            Some(key) if !expired => {
                let copy = Zeroizing::new(**key);
                session.unlocked_at = Some(Instant::now());
                Ok(copy)
            }
            _ => Err(SyncError::VaultLocked),
        }
    }

    // ── Setup / unlock / lock ───────────────────────────────────

    /// First-time vault initialisation. Fails if a vault file exists.
    pub fn setup(&self, passphrase: &str) -> Result<KeyInfo> {
        if self.is_initialized() {
            return Err(SyncError::AlreadyInitialized);
        }

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let key_id = uuid::Uuid::new_v4().simple().to_string();
        let derived = self.derive_key(passphrase, &salt)?;
        let token = verification_token(&derived);

        let file = VaultFile {
            version: 1,
            salt: hex::encode(salt),
            key_id: key_id.clone(),
            verification_token: hex::encode(token),
            previous_key_id: None,
        };
        self.write_vault_file(&file)?;

        self.set_session(derived, key_id.clone());
        tracing::info!(key_id = %key_id, "Vault initialized");
        Ok(KeyInfo {
            key_id,
            previous_key_id: None,
        })
    }

    /// Unlock with a passphrase; holds the session key on success.
    pub fn unlock(&self, passphrase: &str) -> Result<KeyInfo> {
        let file = self.read_vault_file()?;
        let salt = decode_salt(&file.salt)?;
        let derived = self.derive_key(passphrase, &salt)?;

        if !check_token(&derived, &file.verification_token)? {
            return Err(SyncError::InvalidPassphrase);
        }

        self.set_session(derived, file.key_id.clone());
        tracing::info!(key_id = %file.key_id, "Vault unlocked");
        Ok(KeyInfo {
            key_id: file.key_id,
            previous_key_id: file.previous_key_id,
        })
    }

    /// Check a passphrase without touching the session.
    pub fn verify(&self, passphrase: &str) -> Result<bool> {
        let file = self.read_vault_file()?;
        let salt = decode_salt(&file.salt)?;
        let derived = self.derive_key(passphrase, &salt)?;
        check_token(&derived, &file.verification_token)
        // `derived` is Zeroizing — wiped here regardless of outcome
    }

    /// Wipe the session key.
    pub fn lock(&self) {
        self.session.lock().wipe();
        tracing::info!("Vault locked");
    }

    // ── Passphrase rotation ─────────────────────────────────────

    /// Rotate to a new passphrase: fresh salt, fresh key id, atomically
    /// rewritten vault file. The new session key stays held.
    pub fn change_passphrase(&self, current: &str, new: &str) -> Result<KeyInfo> {
        let file = self.read_vault_file()?;
        let old_salt = decode_salt(&file.salt)?;
        let old_derived = self.derive_key(current, &old_salt)?;
        if !check_token(&old_derived, &file.verification_token)? {
            return Err(SyncError::InvalidPassphrase);
        }
        drop(old_derived);

        let mut new_salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut new_salt);
        let new_key_id = uuid::Uuid::new_v4().simple().to_string();
        let new_derived = self.derive_key(new, &new_salt)?;
        let token = verification_token(&new_derived);

        let rotated = VaultFile {
            version: 1,
            salt: hex::encode(new_salt),
            key_id: new_key_id.clone(),
            verification_token: hex::encode(token),
            previous_key_id: Some(file.key_id.clone()),
        };
        self.write_vault_file(&rotated)?;

        self.set_session(new_derived, new_key_id.clone());
        tracing::info!(
            old_key_id = %file.key_id,
            new_key_id = %new_key_id,
            "Passphrase changed"
        );
        Ok(KeyInfo {
            key_id: new_key_id,
            previous_key_id: Some(file.key_id),
        })
    }

    // ── Status ──────────────────────────────────────────────────

    pub fn status(&self) -> VaultStatus {
        VaultStatus {
            initialized: self.is_initialized(),
            unlocked: self.is_unlocked(),
            key_id: self.key_id(),
            timeout_minutes: self.timeout.as_secs() / 60,
        }
    }

    // ── Internal ────────────────────────────────────────────────

    fn derive_key(&self, passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let params = argon2::Params::new(
            self.argon2_memory_kib,
            self.argon2_time_cost,
            self.argon2_parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| SyncError::Corrupt(format!("invalid Argon2 parameters: {e}")))?;
        let argon2 = argon2::Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            params,
        );

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, key.as_mut_slice())
            .map_err(|e| SyncError::Corrupt(format!("key derivation failed: {e}")))?;
        Ok(key)
    }

    fn read_vault_file(&self) -> Result<VaultFile> {
        if !self.is_initialized() {
            return Err(SyncError::VaultNotInitialized);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write via temp file + rename so a crash mid-write cannot leave a
    /// truncated vault.
    fn write_vault_file(&self, file: &VaultFile) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn set_session(&self, key: Zeroizing<[u8; KEY_LEN]>, key_id: String) {
        let mut session = self.session.lock();
        session.wipe();
        session.key = Some(key);
        session.key_id = Some(key_id);
        session.unlocked_at = Some(Instant::now());
    }
}

fn verification_token(key: &[u8; KEY_LEN]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(VERIFICATION_PLAINTEXT);
    mac.finalize().into_bytes().into()
}

/// Constant-time comparison of the derived key's token against the stored
/// one, via the `Mac::verify_slice` contract.
fn check_token(key: &[u8; KEY_LEN], stored_hex: &str) -> Result<bool> {
    let stored = hex::decode(stored_hex)
        .map_err(|_| SyncError::Corrupt("vault verification token is not hex".into()))?;
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(VERIFICATION_PLAINTEXT);
    Ok(mac.verify_slice(&stored).is_ok())
}

fn decode_salt(salt_hex: &str) -> Result<[u8; SALT_LEN]> {
    let bytes =
        hex::decode(salt_hex).map_err(|_| SyncError::Corrupt("vault salt is not hex".into()))?;
    bytes
        .try_into()
        .map_err(|_| SyncError::Corrupt("vault salt has wrong length".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_vault(dir: &TempDir) -> Vault {
        let mut settings = Settings::with_data_dir(dir.path());
        // Keep Argon2 cheap in tests; production defaults are much heavier.
        settings.argon2_time_cost = 1;
        settings.argon2_memory_kib = 8;
        settings.argon2_parallelism = 1;
        Vault::new(&settings)
    }

    #[test]
    fn setup_then_unlock() {
        let tmp = TempDir::new().unwrap();
        let vault = test_vault(&tmp);

        assert!(!vault.is_initialized());
        let info = vault.setup("correct horse battery staple").unwrap();
        assert!(vault.is_initialized());
        assert!(vault.is_unlocked());

        vault.lock();
        assert!(!vault.is_unlocked());
        assert!(vault.get_key().is_err());

        let unlocked = vault.unlock("correct horse battery staple").unwrap();
        assert_eq!(unlocked.key_id, info.key_id);
        assert!(vault.is_unlocked());
        assert_eq!(vault.get_key().unwrap().len(), 32);
    }

    #[test]
    fn setup_twice_fails() {
        let tmp = TempDir::new().unwrap();
        let vault = test_vault(&tmp);
        vault.setup("pw").unwrap();
        assert!(matches!(
            vault.setup("pw"),
            Err(SyncError::AlreadyInitialized)
        ));
    }

    #[test]
    fn wrong_passphrase_rejected() {
        let tmp = TempDir::new().unwrap();
        let vault = test_vault(&tmp);
        vault.setup("right").unwrap();
        vault.lock();

        assert!(matches!(
            vault.unlock("wrong"),
            Err(SyncError::InvalidPassphrase)
        ));
        assert!(!vault.is_unlocked());
    }

    #[test]
    fn unlock_uninitialized_fails() {
        let tmp = TempDir::new().unwrap();
        let vault = test_vault(&tmp);
        assert!(matches!(
            vault.unlock("pw"),
            Err(SyncError::VaultNotInitialized)
        ));
    }

    #[test]
    fn verify_does_not_alter_session() {
        let tmp = TempDir::new().unwrap();
        let vault = test_vault(&tmp);
        vault.setup("pw").unwrap();
        vault.lock();

        assert!(vault.verify("pw").unwrap());
        assert!(!vault.verify("nope").unwrap());
        // verify never unlocks
        assert!(!vault.is_unlocked());
    }

    #[test]
    fn no_key_material_on_disk() {
        let tmp = TempDir::new().unwrap();
        let vault = test_vault(&tmp);
        vault.setup("pw").unwrap();
        let key = vault.get_key().unwrap();

        let raw = std::fs::read_to_string(tmp.path().join("vault.json")).unwrap();
        assert!(!raw.contains("pw"));
        assert!(!raw.contains(&hex::encode(key.as_slice())));

        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["version"], 1);
        assert_eq!(parsed["salt"].as_str().unwrap().len(), SALT_LEN * 2);
        assert_eq!(parsed["verification_token"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn change_passphrase_rotates_key_id() {
        let tmp = TempDir::new().unwrap();
        let vault = test_vault(&tmp);
        let first = vault.setup("old").unwrap();

        let rotated = vault.change_passphrase("old", "new").unwrap();
        assert_ne!(rotated.key_id, first.key_id);
        assert_eq!(rotated.previous_key_id.as_deref(), Some(&*first.key_id));

        // Session stays unlocked with the new key.
        assert!(vault.is_unlocked());

        vault.lock();
        assert!(matches!(
            vault.unlock("old"),
            Err(SyncError::InvalidPassphrase)
        ));
        vault.unlock("new").unwrap();
    }

    #[test]
    fn change_passphrase_wrong_current_leaves_vault_unchanged() {
        let tmp = TempDir::new().unwrap();
        let vault = test_vault(&tmp);
        vault.setup("old").unwrap();
        let before = std::fs::read_to_string(tmp.path().join("vault.json")).unwrap();

        assert!(matches!(
            vault.change_passphrase("wrong", "new"),
            Err(SyncError::InvalidPassphrase)
        ));

        let after = std::fs::read_to_string(tmp.path().join("vault.json")).unwrap();
        assert_eq!(before, after);
        vault.lock();
        vault.unlock("old").unwrap();
    }

    #[test]
    fn get_key_returns_copy() {
        let tmp = TempDir::new().unwrap();
        let vault = test_vault(&tmp);
        vault.setup("pw").unwrap();

        let a = vault.get_key().unwrap();
        let b = vault.get_key().unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn session_expires_after_timeout() {
        let tmp = TempDir::new().unwrap();
        let mut settings = Settings::with_data_dir(tmp.path());
        settings.argon2_time_cost = 1;
        settings.argon2_memory_kib = 8;
        settings.argon2_parallelism = 1;
        settings.session_timeout_minutes = 0; // expires immediately
        let vault = Vault::new(&settings);

        vault.setup("pw").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(!vault.is_unlocked());
        assert!(vault.get_key().is_err());
    }

    #[test]
    fn status_reports_state() {
        let tmp = TempDir::new().unwrap();
        let vault = test_vault(&tmp);

        let status = vault.status();
        assert!(!status.initialized);
        assert!(!status.unlocked);

        vault.setup("pw").unwrap();
        let status = vault.status();
        assert!(status.initialized);
        assert!(status.unlocked);
        assert!(status.key_id.is_some());
        assert_eq!(status.timeout_minutes, 30);
    }
}
