//! AES-256-GCM encryption service backed by the vault session key.
//!
//! Wire format for a single message (interoperable with iOS CryptoKit's
//! `AES.GCM.SealedBox.combined`):
//!
//! ```text
//! nonce(12) || ciphertext || tag(16)
//! ```
//!
//! Encrypted files use the LIME container format:
//!
//! ```text
//! magic "LIME"(4) || version(1) || flags(1) || body
//! ```
//!
//! Small files are sealed in one shot; files over the chunk threshold are
//! split into chunks, each sealed with AAD = `u32_le(chunk_index)` so a
//! reordered or transplanted chunk fails authentication.

use std::path::Path;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::security::vault::Vault;

/// AES-GCM nonce size (96 bits).
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag size.
pub const TAG_LEN: usize = 16;

/// File container magic.
const MAGIC: &[u8; 4] = b"LIME";

/// File container format version.
const FORMAT_VERSION: u8 = 1;

/// Container flag: body is a chunk sequence.
const FLAG_CHUNKED: u8 = 0x01;

/// Files larger than this are chunk-encrypted (1 MiB).
const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Nonce + ciphertext (tag appended by the cipher).
#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// `nonce || ciphertext || tag` wire form.
    pub fn to_combined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_combined(data: &[u8]) -> Result<Self> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(SyncError::Corrupt("combined payload too short".into()));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&data[..NONCE_LEN]);
        Ok(Self {
            nonce,
            ciphertext: data[NONCE_LEN..].to_vec(),
        })
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_combined())
    }

    pub fn from_base64(b64: &str) -> Result<Self> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|_| SyncError::Corrupt("payload is not valid base64".into()))?;
        Self::from_combined(&data)
    }
}

/// Versioned envelope for JSON-carried sync payloads. The `key_id` lets a
/// peer spot passphrase-rotation mismatches before the AEAD check fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub v: u32,
    pub key_id: String,
    pub payload: String,
}

/// Encrypt/decrypt operations backed by the vault key. Cheap to clone
/// behind `Arc`; the key is fetched per call so a vault lock or rotation
/// takes effect immediately.
pub struct EncryptionService {
    vault: Arc<Vault>,
    chunk_size: usize,
}

impl EncryptionService {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self {
            vault,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the chunk threshold (tests use small chunks).
    pub fn with_chunk_size(vault: Arc<Vault>, chunk_size: usize) -> Self {
        Self { vault, chunk_size }
    }

    // ── Low-level ───────────────────────────────────────────────

    pub fn encrypt(&self, plaintext: &[u8], aad: Option<&[u8]>) -> Result<EncryptedPayload> {
        let key = self.vault.get_key()?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|_| SyncError::Corrupt("bad key length".into()))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: aad.unwrap_or(&[]),
                },
            )
            .map_err(|_| SyncError::AuthFailed)?;

        Ok(EncryptedPayload { nonce, ciphertext })
    }

    pub fn decrypt(&self, payload: &EncryptedPayload, aad: Option<&[u8]>) -> Result<Vec<u8>> {
        let key = self.vault.get_key()?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|_| SyncError::Corrupt("bad key length".into()))?;

        cipher
            .decrypt(
                Nonce::from_slice(&payload.nonce),
                Payload {
                    msg: &payload.ciphertext,
                    aad: aad.unwrap_or(&[]),
                },
            )
            .map_err(|_| SyncError::AuthFailed)
    }

    // ── Raw bytes ───────────────────────────────────────────────

    /// Encrypt raw bytes into the combined wire form.
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.encrypt(plaintext, None)?.to_combined())
    }

    /// Decrypt combined wire-form bytes.
    pub fn decrypt_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let payload = EncryptedPayload::from_combined(data)?;
        self.decrypt(&payload, None)
    }

    // ── JSON ────────────────────────────────────────────────────

    /// Encrypt a JSON value (compact separators) into base64.
    pub fn encrypt_json(&self, value: &serde_json::Value) -> Result<String> {
        let plaintext = serde_json::to_vec(value)?;
        Ok(self.encrypt(&plaintext, None)?.to_base64())
    }

    pub fn decrypt_json(&self, b64: &str) -> Result<serde_json::Value> {
        let payload = EncryptedPayload::from_base64(b64)?;
        let plaintext = self.decrypt(&payload, None)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    // ── Sync envelopes ──────────────────────────────────────────

    pub fn encrypt_sync_payload(&self, value: &serde_json::Value) -> Result<SyncEnvelope> {
        let key_id = self.vault.key_id().ok_or(SyncError::VaultLocked)?;
        Ok(SyncEnvelope {
            v: 1,
            key_id,
            payload: self.encrypt_json(value)?,
        })
    }

    /// Decrypt an envelope. A `key_id` mismatch (passphrase rotation in
    /// flight) is logged but decryption is still attempted; the AEAD tag
    /// is the authority.
    pub fn decrypt_sync_payload(&self, envelope: &SyncEnvelope) -> Result<serde_json::Value> {
        if envelope.v != 1 {
            return Err(SyncError::Corrupt(format!(
                "unsupported sync payload version: {}",
                envelope.v
            )));
        }
        if let Some(current) = self.vault.key_id() {
            if current != envelope.key_id {
                tracing::warn!(
                    envelope_key_id = %envelope.key_id,
                    vault_key_id = %current,
                    "Sync payload key id does not match vault key, attempting decrypt anyway"
                );
            }
        }
        self.decrypt_json(&envelope.payload)
    }

    // ── File containers ─────────────────────────────────────────

    /// Encrypt plaintext into a LIME container.
    pub fn encrypt_container(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let chunked = plaintext.len() > self.chunk_size;
        let mut out = Vec::with_capacity(plaintext.len() + 64);
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.push(if chunked { FLAG_CHUNKED } else { 0 });

        if chunked {
            for (index, chunk) in plaintext.chunks(self.chunk_size).enumerate() {
                let aad = (index as u32).to_le_bytes();
                let combined = self.encrypt(chunk, Some(&aad))?.to_combined();
                out.extend_from_slice(&(combined.len() as u32).to_le_bytes());
                out.extend_from_slice(&combined);
            }
            // Zero-length sentinel terminates the chunk sequence.
            out.extend_from_slice(&0u32.to_le_bytes());
        } else {
            let combined = self.encrypt(plaintext, None)?.to_combined();
            out.extend_from_slice(&(combined.len() as u32).to_le_bytes());
            out.extend_from_slice(&combined);
        }
        Ok(out)
    }

    /// Decrypt a LIME container back into plaintext.
    pub fn decrypt_container(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 6 || &data[..4] != MAGIC {
            return Err(SyncError::Corrupt("not a LIME encrypted file".into()));
        }
        let version = data[4];
        if version != FORMAT_VERSION {
            return Err(SyncError::Corrupt(format!(
                "unsupported container version: {version}"
            )));
        }
        let flags = data[5];
        let mut body = &data[6..];

        if flags & FLAG_CHUNKED != 0 {
            let mut plaintext = Vec::new();
            let mut index: u32 = 0;
            loop {
                let len = read_u32(&mut body)?;
                if len == 0 {
                    break;
                }
                let combined = read_exact(&mut body, len as usize)?;
                let payload = EncryptedPayload::from_combined(combined)?;
                let aad = index.to_le_bytes();
                plaintext.extend_from_slice(&self.decrypt(&payload, Some(&aad))?);
                index += 1;
            }
            Ok(plaintext)
        } else {
            let len = read_u32(&mut body)?;
            let combined = read_exact(&mut body, len as usize)?;
            let payload = EncryptedPayload::from_combined(combined)?;
            self.decrypt(&payload, None)
        }
    }

    /// Encrypt a file on disk into a container byte vector.
    pub fn encrypt_file_to_vec(&self, src: &Path) -> Result<Vec<u8>> {
        let plaintext = std::fs::read(src)?;
        self.encrypt_container(&plaintext)
    }

    /// Encrypt `src` into a container file at `dst`.
    pub fn encrypt_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let container = self.encrypt_file_to_vec(src)?;
        std::fs::write(dst, container)?;
        Ok(())
    }

    /// Decrypt a container file at `src` into plaintext at `dst`.
    pub fn decrypt_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let data = std::fs::read(src)?;
        let plaintext = self.decrypt_container(&data)?;
        std::fs::write(dst, plaintext)?;
        Ok(())
    }
}

fn read_u32(body: &mut &[u8]) -> Result<u32> {
    let bytes = read_exact(body, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
}

fn read_exact<'a>(body: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if body.len() < len {
        return Err(SyncError::Corrupt("truncated container".into()));
    }
    let (head, tail) = body.split_at(len);
    *body = tail;
    Ok(head)
}
