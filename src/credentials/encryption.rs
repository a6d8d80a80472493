//! AES-256-GCM encryption and machine-scoped key derivation for the session token.
//!
//! The token is encrypted with a key derived from the current machine's identity
//! (hostname + local username) and a per-machine random salt, so a credential
//! file copied to another machine will not decrypt there.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of the per-machine salt in bytes
pub const SALT_SIZE: usize = 32;

/// PBKDF2-HMAC-SHA256 iteration count for key derivation.
///
/// Fixed: changing this invalidates every existing credential record.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Encrypted token payload as stored on disk.
///
/// Ciphertext, nonce, and authentication tag are kept as separate
/// base64-encoded fields so a record with any of them missing is
/// detectable as corrupted before decryption is attempted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EncryptedPayload {
    /// Base64-encoded ciphertext (without the authentication tag)
    pub ciphertext: String,
    /// Base64-encoded 12-byte nonce
    pub iv: String,
    /// Base64-encoded 16-byte GCM authentication tag
    pub auth_tag: String,
}

/// Cryptographic errors.
///
/// `TamperDetected` is surfaced separately from `Malformed` because the
/// remediation differs: re-authenticate versus investigate corruption.
#[derive(Debug, PartialEq, Clone)]
pub enum CryptoError {
    /// Plaintext was empty
    EmptyPlaintext,
    /// Key was not exactly `KEY_SIZE` bytes
    InvalidKeyLength { expected: usize, got: usize },
    /// Input could not be decoded (bad base64, wrong nonce/tag length)
    Malformed(String),
    /// GCM authentication tag did not verify (tampered data or wrong key)
    TamperDetected,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::EmptyPlaintext => write!(f, "Cannot encrypt empty plaintext"),
            CryptoError::InvalidKeyLength { expected, got } => {
                write!(f, "Encryption key must be {} bytes, got {}", expected, got)
            }
            CryptoError::Malformed(msg) => write!(f, "Malformed encrypted payload: {}", msg),
            CryptoError::TamperDetected => write!(
                f,
                "Authentication tag verification failed (tampered data or wrong key)"
            ),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Derive a 256-bit encryption key from secret material and a salt.
///
/// Deterministic: the same (secret, salt) pair always yields the same key.
/// Uses PBKDF2-HMAC-SHA256 with [`PBKDF2_ITERATIONS`] iterations.
pub fn derive_key(secret_material: &[u8], salt: &[u8]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(secret_material, salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypt plaintext with AES-256-GCM using a fresh random nonce.
///
/// # Returns
/// * `Ok(EncryptedPayload)` - Ciphertext, nonce, and authentication tag (base64)
/// * `Err` - If the plaintext is empty or the key length is wrong
pub fn encrypt(plaintext: &str, key: &[u8]) -> Result<EncryptedPayload, CryptoError> {
    if plaintext.is_empty() {
        return Err(CryptoError::EmptyPlaintext);
    }
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            got: key.len(),
        });
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_SIZE,
        got: key.len(),
    })?;

    // Generate random nonce (never reuse!)
    let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

    // aes-gcm appends the 16-byte tag to the ciphertext; split it out so the
    // record stores the tag as its own field
    let mut combined = cipher
        .encrypt(&nonce_bytes, plaintext.as_bytes())
        .map_err(|_| CryptoError::Malformed("encryption failed".to_string()))?;
    let tag_bytes = combined.split_off(combined.len() - TAG_SIZE);

    Ok(EncryptedPayload {
        ciphertext: BASE64.encode(&combined),
        iv: BASE64.encode(nonce_bytes),
        auth_tag: BASE64.encode(&tag_bytes),
    })
}

/// Decrypt an [`EncryptedPayload`] with AES-256-GCM.
///
/// # Returns
/// * `Ok(String)` - Decrypted plaintext
/// * `Err(CryptoError::TamperDetected)` - Authentication tag did not verify
/// * `Err(CryptoError::Malformed)` - Bad base64 or wrong nonce/tag length
pub fn decrypt(payload: &EncryptedPayload, key: &[u8]) -> Result<String, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            got: key.len(),
        });
    }

    let ciphertext_bytes = BASE64
        .decode(&payload.ciphertext)
        .map_err(|e| CryptoError::Malformed(format!("ciphertext: {}", e)))?;
    let nonce_bytes = BASE64
        .decode(&payload.iv)
        .map_err(|e| CryptoError::Malformed(format!("iv: {}", e)))?;
    let tag_bytes = BASE64
        .decode(&payload.auth_tag)
        .map_err(|e| CryptoError::Malformed(format!("auth_tag: {}", e)))?;

    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::Malformed(format!(
            "invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        )));
    }
    if tag_bytes.len() != TAG_SIZE {
        return Err(CryptoError::Malformed(format!(
            "invalid auth tag size: expected {}, got {}",
            TAG_SIZE,
            tag_bytes.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_SIZE,
        got: key.len(),
    })?;

    let nonce = Nonce::from_slice(&nonce_bytes);

    // Reassemble ciphertext || tag for the AEAD API
    let mut combined = ciphertext_bytes;
    combined.extend_from_slice(&tag_bytes);

    // GCM decryption failure means the tag did not verify: either the data
    // was tampered with or the key is wrong. Both map to the tamper class.
    let plaintext_bytes = cipher
        .decrypt(nonce, combined.as_ref())
        .map_err(|_| CryptoError::TamperDetected)?;

    String::from_utf8(plaintext_bytes)
        .map_err(|_| CryptoError::Malformed("decrypted data is not valid UTF-8".to_string()))
}

/// Compute the current machine's identity hash.
///
/// SHA-256 over hostname and local username, hex-encoded. Used only to
/// scope the local encryption key; never sent to any remote service.
/// Recomputed on every call, not stored directly.
pub fn machine_identity() -> String {
    let mut hasher = Sha256::new();
    hasher.update(machine_secret_material());
    hex::encode(hasher.finalize())
}

/// Secret material for machine-scoped key derivation.
pub fn machine_secret_material() -> Vec<u8> {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown-user".to_string());
    format!("host={}|user={}", host, user).into_bytes()
}
