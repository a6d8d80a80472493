//! Encrypted credential storage for the session token.
//!
//! This module is the single trust boundary protecting the session token at
//! rest. The token is encrypted with AES-256-GCM under a key derived from
//! the current machine's identity and a per-machine random salt.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - save / load / delete one record       │
//! │  - validate() / repair() integrity ops   │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                  │
//! │  - AES-256-GCM, fresh nonce per record   │
//! │  - PBKDF2 machine-scoped key derivation  │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Owner-only files on disk           │
//! │  - credentials.json (0600)               │
//! │  - salt (0600), directory (0700)         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - Authenticated encryption: a bit-flip in the record is detected, never
//!   silently decrypted into garbage
//! - The machine identity hash scopes the key to this machine; it is never
//!   sent to any remote service
//! - A record copied from another machine logs a provenance warning and is
//!   still offered to decryption (it will usually fail the auth check)

mod encryption;
mod storage;

pub use encryption::{
    decrypt, derive_key, encrypt, machine_identity, CryptoError, EncryptedPayload, KEY_SIZE,
    SALT_SIZE,
};
pub use storage::{CredentialRecord, CredentialStore, StoreError};
