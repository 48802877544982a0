//! Key rotation and credential re-encryption
//!
//! The new key is persisted before any row is rewritten, so at every point the
//! key file holds each key a stored row may reference. A row that cannot be
//! decrypted is left untouched and reported; re-running `migrate_only` later
//! picks it up once the cause is fixed.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use super::credential::CredentialVault;
use super::error::{RotationError, VaultError};
use super::keystore::KeyVersion;
use super::secret::EncryptedSecret;
use crate::registry::{ServerRecord, ServerRegistry};

/// A registry row left on its old key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    pub alias: String,
    pub reason: String,
}

/// Outcome of one rotation or migration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    /// Primary version in effect after the run
    pub version: KeyVersion,
    /// Aliases re-encrypted under `version`
    pub migrated: Vec<String>,
    /// Aliases already current or without secrets
    pub unchanged: Vec<String>,
    pub skipped: Vec<SkippedRow>,
}

impl RotationReport {
    fn new(version: KeyVersion) -> Self {
        Self {
            version,
            migrated: Vec::new(),
            unchanged: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

pub struct RotationOrchestrator {
    vault: Arc<CredentialVault>,
    registry: Arc<dyn ServerRegistry>,
    /// One rotation or migration at a time
    lock: Mutex<()>,
}

impl RotationOrchestrator {
    pub fn new(vault: Arc<CredentialVault>, registry: Arc<dyn ServerRegistry>) -> Self {
        Self {
            vault,
            registry,
            lock: Mutex::new(()),
        }
    }

    /// Mint a new primary key and re-encrypt every stored credential under it
    pub async fn rotate_and_migrate(&self) -> Result<RotationReport, RotationError> {
        let _guard = self.lock.lock().await;

        let version = self.vault.rotate()?;
        info!("Migrating stored credentials to key {}", version);
        self.migrate_rows(version).await
    }

    /// Re-encrypt rows not yet under the primary key, without minting a new one
    pub async fn migrate_only(&self) -> Result<RotationReport, RotationError> {
        let _guard = self.lock.lock().await;

        // Another process may have rotated since this vault was opened
        let version = self.vault.load()?.primary_version();
        info!("Migrating stale credentials to current key {}", version);
        self.migrate_rows(version).await
    }

    async fn migrate_rows(&self, version: KeyVersion) -> Result<RotationReport, RotationError> {
        let mut report = RotationReport::new(version);

        for record in self.registry.list().await? {
            let alias = record.alias.clone();

            if !self.row_needs_migration(&record) {
                report.unchanged.push(alias);
                continue;
            }

            match self.reencrypt(&record) {
                Ok((password, key_path)) => {
                    match self
                        .registry
                        .update_secrets(&alias, password, key_path)
                        .await
                    {
                        Ok(()) => report.migrated.push(alias),
                        Err(e) => {
                            warn!("Failed to store re-encrypted secrets for {}: {}", alias, e);
                            report.skipped.push(SkippedRow {
                                alias,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!("Skipping {} during key migration: {}", alias, e);
                    report.skipped.push(SkippedRow {
                        alias,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Key migration to {} finished: {} migrated, {} unchanged, {} skipped",
            version,
            report.migrated.len(),
            report.unchanged.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    fn row_needs_migration(&self, record: &ServerRecord) -> bool {
        [&record.encrypted_password, &record.encrypted_key_path]
            .into_iter()
            .flatten()
            .any(|secret| self.vault.needs_migration(secret))
    }

    /// Both fields decrypt or neither is rewritten
    fn reencrypt(
        &self,
        record: &ServerRecord,
    ) -> Result<(Option<EncryptedSecret>, Option<EncryptedSecret>), VaultError> {
        let password = self.reencrypt_field(record.encrypted_password.as_ref())?;
        let key_path = self.reencrypt_field(record.encrypted_key_path.as_ref())?;
        Ok((password, key_path))
    }

    fn reencrypt_field(
        &self,
        secret: Option<&EncryptedSecret>,
    ) -> Result<Option<EncryptedSecret>, VaultError> {
        secret
            .map(|secret| {
                let plaintext = self.vault.decrypt(secret)?;
                self.vault.encrypt(&plaintext)
            })
            .transpose()
    }
}
