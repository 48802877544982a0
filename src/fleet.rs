//! Wiring from [`FleetConfig`] to a ready pool

use std::sync::Arc;

use tracing::info;

use crate::config::FleetConfig;
use crate::pool::ConnectionPool;
use crate::registry::{JsonFileRegistry, ServerRegistry};
use crate::ssh::{Connector, RusshConnector};
use crate::vault::{CredentialVault, RotationOrchestrator, VaultError};

/// The vault, registry and pool of one process
pub struct Fleet {
    pub vault: Arc<CredentialVault>,
    pub registry: Arc<JsonFileRegistry>,
    pub pool: Arc<ConnectionPool>,
}

impl Fleet {
    /// Open the key file and registry named by `config` and build a pool
    /// that connects over russh
    ///
    /// The health check is not started.
    pub fn open(config: &FleetConfig) -> Result<Self, VaultError> {
        let connector: Arc<dyn Connector> = Arc::new(RusshConnector::new(config.ssh.clone()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(
        config: &FleetConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, VaultError> {
        let vault = Arc::new(CredentialVault::open(&config.key_file)?);
        let registry = Arc::new(JsonFileRegistry::new(&config.registry_file));
        let pool = Arc::new(ConnectionPool::new(
            registry.clone(),
            vault.clone(),
            connector,
            config.pool_options(),
        ));

        info!(
            "Fleet ready: key file {} (primary {}), registry {}",
            config.key_file.display(),
            vault.primary_version(),
            config.registry_file.display()
        );
        Ok(Self {
            vault,
            registry,
            pool,
        })
    }

    pub fn rotation(&self) -> RotationOrchestrator {
        let registry: Arc<dyn ServerRegistry> = self.registry.clone();
        RotationOrchestrator::new(self.vault.clone(), registry)
    }
}
