//! shellfleet - pooled SSH sessions to a fleet of named servers
//!
//! Servers are looked up by alias in a [`registry`], their credentials are
//! decrypted through the [`vault`], and connections are kept in a
//! [`pool::ConnectionPool`] for reuse by one-shot commands and persistent
//! interactive shells.

pub mod config;
pub mod fleet;
pub mod pool;
pub mod registry;
pub mod session;
pub mod ssh;
pub mod vault;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, FleetConfig};
pub use fleet::Fleet;
pub use pool::{
    CommandResult, ConnectionPool, KillOutcome, PoolError, PoolOptions, PooledSession,
};
pub use registry::{JsonFileRegistry, MemoryRegistry, ServerRecord, ServerRegistry};
pub use session::{CommandOptions, CommandOutput, OutputChunk, Session};
pub use vault::{CredentialVault, EncryptedSecret, RotationOrchestrator, RotationReport};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// `RUST_LOG` overrides the default `info` level. Calling this more than once
/// is harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
