//! Encrypted on-disk credential store.
//!
//! Persists a single session token encrypted at rest, together with the
//! per-machine salt used for key derivation:
//!
//! ```text
//! <config-dir>/tollgit/
//! ├── credentials.json   (0600) encrypted record
//! └── salt               (0600) 32 random bytes, generated once per machine
//! ```
//!
//! The directory itself is owner-only (0700). The store is single-writer:
//! only the current process touches it, and only during save/delete.

use super::encryption::{self, CryptoError, EncryptedPayload, SALT_SIZE};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Credential record format version
const STORE_VERSION: u32 = 1;

const RECORD_FILE: &str = "credentials.json";
const SALT_FILE: &str = "salt";

/// Store errors.
///
/// `Absent` is not an error: `load_token` returns `Ok(None)` instead.
#[derive(Debug)]
pub enum StoreError {
    /// Record exists but cannot be trusted: missing fields, unparseable
    /// JSON, wrong-length salt, or malformed ciphertext
    Corrupted(String),
    /// Authentication tag verification failed (tampered record or a key
    /// derived on a different machine)
    TamperDetected,
    /// Token passed to `save_token` was empty
    EmptyToken,
    /// Underlying filesystem failure
    Io(std::io::Error),
    /// No per-user configuration directory could be resolved
    NoConfigDir,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Corrupted(msg) => write!(f, "Credential store corrupted: {}", msg),
            StoreError::TamperDetected => write!(
                f,
                "Credential record failed authentication (tampered or encrypted on another machine)"
            ),
            StoreError::EmptyToken => write!(f, "Cannot save an empty token"),
            StoreError::Io(e) => write!(f, "Credential store I/O error: {}", e),
            StoreError::NoConfigDir => {
                write!(f, "Could not resolve a per-user configuration directory")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<CryptoError> for StoreError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::TamperDetected => StoreError::TamperDetected,
            other => StoreError::Corrupted(other.to_string()),
        }
    }
}

/// On-disk credential record.
///
/// `ciphertext`, `iv`, and `auth_tag` must all be present and non-empty;
/// anything less is treated as corruption. `machine_id` is a provenance
/// hint only: a mismatch logs a warning but never blocks decryption.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub version: u32,
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
    pub created_at: DateTime<Utc>,
    pub machine_id: String,
    #[serde(default)]
    pub payment_mode: Option<String>,
}

/// File-based store for one encrypted session token.
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Create a store rooted at the given directory (not created yet;
    /// call [`ensure_store_ready`](Self::ensure_store_ready)).
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Create a store at the default per-user location.
    pub fn default_location() -> Result<Self, StoreError> {
        let base = dirs::config_dir().ok_or(StoreError::NoConfigDir)?;
        Ok(Self::new(base.join("tollgit")))
    }

    /// Directory this store lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    fn salt_path(&self) -> PathBuf {
        self.dir.join(SALT_FILE)
    }

    /// Idempotently create the storage directory with owner-only permissions.
    ///
    /// If the directory already exists with wrong permissions they are
    /// corrected and a warning is logged; a fixable mismatch never fails
    /// the operation.
    pub fn ensure_store_ready(&self) -> Result<(), StoreError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
            set_mode(&self.dir, 0o700)?;
            debug!(dir = %self.dir.display(), "Created credential store directory");
            return Ok(());
        }

        #[cfg(unix)]
        {
            let mode = file_mode(&self.dir)?;
            if mode != 0o700 {
                warn!(
                    dir = %self.dir.display(),
                    mode = format!("{:o}", mode),
                    "Store directory had loose permissions, correcting to 0700"
                );
                set_mode(&self.dir, 0o700)?;
            }
        }

        Ok(())
    }

    /// Load the per-machine salt, generating it on first use.
    ///
    /// A salt file of unexpected length is corruption and is never
    /// silently used.
    fn load_or_create_salt(&self) -> Result<[u8; SALT_SIZE], StoreError> {
        let path = self.salt_path();

        if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.len() != SALT_SIZE {
                return Err(StoreError::Corrupted(format!(
                    "salt file must be {} bytes, found {}",
                    SALT_SIZE,
                    bytes.len()
                )));
            }
            let mut salt = [0u8; SALT_SIZE];
            salt.copy_from_slice(&bytes);
            return Ok(salt);
        }

        let mut salt = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        fs::write(&path, salt)?;
        set_mode(&path, 0o600)?;
        debug!(path = %path.display(), "Generated new encryption salt");
        Ok(salt)
    }

    /// Derive the machine-scoped encryption key.
    fn machine_key(&self) -> Result<[u8; encryption::KEY_SIZE], StoreError> {
        let salt = self.load_or_create_salt()?;
        Ok(encryption::derive_key(
            &encryption::machine_secret_material(),
            &salt,
        ))
    }

    /// Encrypt and persist a session token, replacing any existing record.
    ///
    /// The write is atomic (temp file + rename) and the record file ends
    /// up owner-only. `payment_mode` records the mode active at save time.
    pub fn save_token(&self, token: &str, payment_mode: Option<&str>) -> Result<(), StoreError> {
        if token.is_empty() {
            return Err(StoreError::EmptyToken);
        }

        self.ensure_store_ready()?;
        let key = self.machine_key()?;
        let payload = encryption::encrypt(token, &key)?;

        let record = CredentialRecord {
            version: STORE_VERSION,
            ciphertext: payload.ciphertext,
            iv: payload.iv,
            auth_tag: payload.auth_tag,
            created_at: Utc::now(),
            machine_id: encryption::machine_identity(),
            payment_mode: payment_mode.map(|m| m.to_string()),
        };

        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| StoreError::Corrupted(format!("failed to serialize record: {}", e)))?;

        let path = self.record_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        set_mode(&tmp, 0o600)?;
        fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), "Saved encrypted credential record");
        Ok(())
    }

    /// Load and decrypt the stored session token.
    ///
    /// # Returns
    /// * `Ok(Some(token))` - Record found and decrypted
    /// * `Ok(None)` - No record exists (not an error)
    /// * `Err(StoreError::Corrupted)` - Missing fields, bad JSON, bad salt
    /// * `Err(StoreError::TamperDetected)` - Authentication check failed
    pub fn load_token(&self) -> Result<Option<String>, StoreError> {
        let path = self.record_path();
        if !path.exists() {
            return Ok(None);
        }

        if !self.salt_path().exists() {
            return Err(StoreError::Corrupted(
                "credential record exists but the salt file is missing".to_string(),
            ));
        }

        let contents = fs::read_to_string(&path)?;
        let record: CredentialRecord = serde_json::from_str(&contents)
            .map_err(|e| StoreError::Corrupted(format!("unparseable record: {}", e)))?;

        if record.ciphertext.is_empty() || record.iv.is_empty() || record.auth_tag.is_empty() {
            return Err(StoreError::Corrupted(
                "record is missing ciphertext, iv, or auth_tag".to_string(),
            ));
        }

        // Provenance hint only. The key is derived from the same identity,
        // so a mismatch usually also fails decryption below; still attempt.
        let current_machine = encryption::machine_identity();
        if record.machine_id != current_machine {
            warn!(
                record_machine = %record.machine_id,
                current_machine = %current_machine,
                "Credential record was created on a different machine, attempting decryption anyway"
            );
        }

        let key = self.machine_key()?;
        let payload = EncryptedPayload {
            ciphertext: record.ciphertext,
            iv: record.iv,
            auth_tag: record.auth_tag,
        };

        let token = encryption::decrypt(&payload, &key)?;
        Ok(Some(token))
    }

    /// Remove the credential record.
    ///
    /// Returns whether anything was deleted; never fails merely because
    /// nothing existed. The salt file is kept (read-mostly, reused by the
    /// next login on this machine).
    pub fn delete_token(&self) -> Result<bool, StoreError> {
        let path = self.record_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a credential record exists on disk.
    pub fn has_token(&self) -> bool {
        self.record_path().exists()
    }

    /// Read-only integrity check.
    ///
    /// Reports issues without touching anything: permission bits, record
    /// parseability, required fields, salt length. An empty result means
    /// the store looks healthy (or simply holds no record yet).
    pub fn validate(&self) -> Result<Vec<String>, StoreError> {
        let mut issues = Vec::new();

        if !self.dir.exists() {
            return Ok(issues);
        }

        #[cfg(unix)]
        {
            let mode = file_mode(&self.dir)?;
            if mode != 0o700 {
                issues.push(format!(
                    "store directory permissions are {:o}, expected 700",
                    mode
                ));
            }
        }

        let salt_path = self.salt_path();
        if salt_path.exists() {
            #[cfg(unix)]
            {
                let mode = file_mode(&salt_path)?;
                if mode != 0o600 {
                    issues.push(format!("salt file permissions are {:o}, expected 600", mode));
                }
            }
            let len = fs::metadata(&salt_path)?.len();
            if len != SALT_SIZE as u64 {
                issues.push(format!("salt file is {} bytes, expected {}", len, SALT_SIZE));
            }
        }

        let record_path = self.record_path();
        if record_path.exists() {
            #[cfg(unix)]
            {
                let mode = file_mode(&record_path)?;
                if mode != 0o600 {
                    issues.push(format!(
                        "credential record permissions are {:o}, expected 600",
                        mode
                    ));
                }
            }
            match fs::read_to_string(&record_path) {
                Ok(contents) => match serde_json::from_str::<CredentialRecord>(&contents) {
                    Ok(record) => {
                        if record.ciphertext.is_empty()
                            || record.iv.is_empty()
                            || record.auth_tag.is_empty()
                        {
                            issues.push(
                                "credential record is missing ciphertext, iv, or auth_tag"
                                    .to_string(),
                            );
                        }
                    }
                    Err(e) => issues.push(format!("credential record is unparseable: {}", e)),
                },
                Err(e) => issues.push(format!("credential record is unreadable: {}", e)),
            }

            if !salt_path.exists() {
                issues.push("credential record exists but the salt file is missing".to_string());
            }
        }

        Ok(issues)
    }

    /// Best-effort fixer: corrects permission bits on the directory and
    /// files. Never reconstructs lost ciphertext or rewrites record
    /// contents. Returns a description of each fix applied.
    pub fn repair(&self) -> Result<Vec<String>, StoreError> {
        let mut fixed = Vec::new();

        if !self.dir.exists() {
            return Ok(fixed);
        }

        #[cfg(unix)]
        {
            if file_mode(&self.dir)? != 0o700 {
                set_mode(&self.dir, 0o700)?;
                fixed.push("store directory permissions set to 700".to_string());
            }
            for (path, label) in [
                (self.salt_path(), "salt file"),
                (self.record_path(), "credential record"),
            ] {
                if path.exists() && file_mode(&path)? != 0o600 {
                    set_mode(&path, 0o600)?;
                    fixed.push(format!("{} permissions set to 600", label));
                }
            }
        }

        for fix in &fixed {
            warn!(fix = %fix, "Repaired credential store");
        }
        Ok(fixed)
    }
}

#[cfg(unix)]
fn file_mode(path: &Path) -> std::io::Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o777)
}

fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}
