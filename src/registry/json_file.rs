//! JSON-file backed registry
//!
//! File layout:
//!
//! ```text
//! { "version": 1, "servers": [ { "alias": "...", "hostname": "...", ... } ] }
//! ```
//!
//! Secrets are stored base64 encoded. Writes go through a temp file and rename.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{RegistryError, ServerRecord, ServerRegistry};
use crate::vault::EncryptedSecret;

/// Current registry file format version
pub const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    #[serde(default)]
    servers: Vec<ServerRecord>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            servers: Vec::new(),
        }
    }
}

pub struct JsonFileRegistry {
    path: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl JsonFileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file reads as empty. A file that does not parse is backed up
    /// and reported; it is never treated as empty, since a later save would
    /// then wipe every record.
    async fn load(&self) -> Result<RegistryFile, RegistryError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryFile::default())
            }
            Err(e) => return Err(RegistryError::Io(e)),
        };

        let file = match serde_json::from_str::<RegistryFile>(&contents) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Registry file {:?} corrupted: {}", self.path, e);
                match self.backup().await {
                    Ok(backup_path) => {
                        tracing::warn!("Corrupted registry backed up to {:?}", backup_path)
                    }
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted registry: {}", backup_err)
                    }
                }
                return Err(RegistryError::Corrupt {
                    path: self.path.clone(),
                    reason: e.to_string(),
                });
            }
        };

        if file.version > REGISTRY_VERSION {
            return Err(RegistryError::VersionTooNew {
                found: file.version,
                supported: REGISTRY_VERSION,
            });
        }
        Ok(file)
    }

    async fn save(&self, file: &RegistryFile) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(file)?;

        let mut out = fs::File::create(&temp_path).await?;
        out.write_all(json.as_bytes()).await?;
        out.sync_all().await?;
        drop(out);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    async fn backup(&self) -> Result<PathBuf, RegistryError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::copy(&self.path, &backup_path).await?;
        Ok(backup_path)
    }

    /// Insert or replace a record by alias
    pub async fn upsert(&self, record: ServerRecord) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;

        match file.servers.iter_mut().find(|s| s.alias == record.alias) {
            Some(existing) => *existing = record,
            None => file.servers.push(record),
        }
        self.save(&file).await
    }

    /// Remove a record; returns whether it existed
    pub async fn remove(&self, alias: &str) -> Result<bool, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;

        let before = file.servers.len();
        file.servers.retain(|s| s.alias != alias);
        if file.servers.len() == before {
            return Ok(false);
        }
        self.save(&file).await?;
        Ok(true)
    }
}

#[async_trait]
impl ServerRegistry for JsonFileRegistry {
    async fn get(&self, alias: &str) -> Result<Option<ServerRecord>, RegistryError> {
        let file = self.load().await?;
        Ok(file.servers.into_iter().find(|s| s.alias == alias))
    }

    async fn list(&self) -> Result<Vec<ServerRecord>, RegistryError> {
        Ok(self.load().await?.servers)
    }

    async fn update_secrets(
        &self,
        alias: &str,
        encrypted_password: Option<EncryptedSecret>,
        encrypted_key_path: Option<EncryptedSecret>,
    ) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;

        let record = file
            .servers
            .iter_mut()
            .find(|s| s.alias == alias)
            .ok_or_else(|| RegistryError::NotFound(alias.to_string()))?;
        record.encrypted_password = encrypted_password;
        record.encrypted_key_path = encrypted_key_path;

        self.save(&file).await
    }
}
