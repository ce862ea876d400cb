//! Passphrase-wrapped key escrow ("recovery kit").
//!
//! A recovery kit wraps the raw 32-byte data key with AES-256-GCM, the
//! wrapping key derived from a user passphrase via Argon2id. The kit is
//! persisted as structured text and holds everything needed to recover the
//! data key except the passphrase itself.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::EncryptionKey;
use crate::error::{Result, SnapError};

pub const RECOVERY_KIT_VERSION: u32 = 1;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const MIN_PASSPHRASE_LEN: usize = 8;

// Argon2id parameters for the passphrase KDF.
const ARGON2_TIME: u32 = 3;
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_LANES: u32 = 4;
const ARGON2_OUT_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryKit {
    pub version: u32,
    /// Hex-encoded 16-byte KDF salt.
    pub salt: String,
    /// Hex-encoded `nonce || ciphertext+tag` wrapping the data key.
    pub encrypted_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn derive_wrapping_key(passphrase: &str, salt: &[u8]) -> Result<[u8; ARGON2_OUT_LEN]> {
    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_TIME, ARGON2_LANES, Some(ARGON2_OUT_LEN))
        .map_err(|e| SnapError::InvalidKey(format!("invalid Argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut secret = passphrase.as_bytes().to_vec();
    let mut out = [0u8; ARGON2_OUT_LEN];
    let result = argon2
        .hash_password_into(&secret, salt, &mut out)
        .map_err(|e| SnapError::InvalidKey(format!("key derivation failed: {e}")));
    secret.zeroize();
    result?;
    Ok(out)
}

/// Wrap `key` under `passphrase`, producing a kit suitable for persisting
/// alongside (but never inside) the backups it protects.
pub fn create_recovery_kit(
    key: &EncryptionKey,
    passphrase: &str,
    hint: Option<&str>,
) -> Result<RecoveryKit> {
    if passphrase.len() < MIN_PASSPHRASE_LEN {
        return Err(SnapError::InvalidKey(format!(
            "passphrase must be at least {MIN_PASSPHRASE_LEN} characters"
        )));
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let mut wrapping_key = derive_wrapping_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&wrapping_key));
    wrapping_key.zeroize();

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), key.as_bytes().as_slice())
        .map_err(|_| SnapError::InvalidKey("failed to wrap key".into()))?;

    let mut blob = nonce.to_vec();
    blob.extend_from_slice(&ciphertext);

    Ok(RecoveryKit {
        version: RECOVERY_KIT_VERSION,
        salt: hex::encode(salt),
        encrypted_key: hex::encode(blob),
        hint: hint.map(str::to_string),
    })
}

/// Recover the data key from a kit using `passphrase`.
pub fn recover_key(kit: &RecoveryKit, passphrase: &str) -> Result<EncryptionKey> {
    if kit.version != RECOVERY_KIT_VERSION {
        return Err(SnapError::InvalidKey(format!(
            "unsupported recovery kit version: {}",
            kit.version
        )));
    }

    let salt = hex::decode(&kit.salt)
        .map_err(|e| SnapError::InvalidKey(format!("invalid salt: {e}")))?;
    let blob = hex::decode(&kit.encrypted_key)
        .map_err(|e| SnapError::InvalidKey(format!("invalid encrypted key: {e}")))?;
    if blob.len() < NONCE_LEN {
        return Err(SnapError::InvalidKey("ciphertext too short".into()));
    }

    let mut wrapping_key = derive_wrapping_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&wrapping_key));
    wrapping_key.zeroize();

    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let mut key_bytes = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SnapError::InvalidKey("decryption failed (wrong passphrase?)".into()))?;

    let key = EncryptionKey::from_bytes(&key_bytes);
    key_bytes.zeroize();
    key
}
