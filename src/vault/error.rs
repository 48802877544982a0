//! Error types for the credential vault

use std::path::PathBuf;

use thiserror::Error;

use super::keystore::KeyVersion;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum VaultError {
    /// The key file exists but cannot be trusted. Never replaced automatically.
    #[error("Key store {path:?} is corrupt: {reason}")]
    KeyStoreCorrupt { path: PathBuf, reason: String },

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    /// Two stores hold different keys under one version label
    #[error("Key store conflict: two different keys are labelled {0}")]
    KeyConflict(KeyVersion),

    #[error("Key version space exhausted")]
    VersionExhausted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VaultError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        VaultError::KeyStoreCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that abort a rotation as a whole.
///
/// Per-row failures are not errors; they are reported in `RotationReport::skipped`.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}
