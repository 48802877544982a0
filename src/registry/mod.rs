//! Server Registry
//!
//! The store of server records the pool connects to. The session core only
//! reads records; key rotation is the one writer, and only of the two secret
//! fields.

pub mod json_file;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::vault::EncryptedSecret;

pub use json_file::JsonFileRegistry;
pub use memory::MemoryRegistry;

fn default_port() -> u16 {
    22
}

/// One remote host as stored in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Unique handle used by callers
    pub alias: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<EncryptedSecret>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_key_path: Option<EncryptedSecret>,
}

impl ServerRecord {
    pub fn new(alias: impl Into<String>, hostname: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            hostname: hostname.into(),
            port: default_port(),
            user: user.into(),
            encrypted_password: None,
            encrypted_key_path: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, secret: EncryptedSecret) -> Self {
        self.encrypted_password = Some(secret);
        self
    }

    pub fn with_key_path(mut self, secret: EncryptedSecret) -> Self {
        self.encrypted_key_path = Some(secret);
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.encrypted_password.is_some() || self.encrypted_key_path.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Server not found: {0}")]
    NotFound(String),

    #[error("Registry file {path:?} is corrupt: {reason}")]
    Corrupt {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("Registry version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Source of server records
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    async fn get(&self, alias: &str) -> Result<Option<ServerRecord>, RegistryError>;

    async fn list(&self) -> Result<Vec<ServerRecord>, RegistryError>;

    /// Overwrite both secret fields of `alias`
    async fn update_secrets(
        &self,
        alias: &str,
        encrypted_password: Option<EncryptedSecret>,
        encrypted_key_path: Option<EncryptedSecret>,
    ) -> Result<(), RegistryError>;
}
