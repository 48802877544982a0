//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, HostKeyPolicy, SshConfig, SshTuning};
use super::error::SshError;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::session::SshSession;
use super::transport::{Connector, Transport};

/// One-shot connector for a single target
pub struct SshClient {
    config: SshConfig,
    tuning: SshTuning,
    known_hosts: Arc<KnownHostsStore>,
}

impl SshClient {
    pub fn new(config: SshConfig, tuning: SshTuning, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            config,
            tuning,
            known_hosts,
        }
    }

    /// Connect, verify the host key, and authenticate
    pub async fn connect(self) -> Result<SshSession, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let timeout = Duration::from_secs(self.tuning.connect_timeout_secs);

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::time::timeout(timeout, tokio::net::lookup_host(&addr))
            .await
            .map_err(|_| SshError::Timeout(format!("Resolving {} timed out", addr)))?
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed(format!("No address found for {}", addr)))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(self.tuning.keepalive_interval_secs)),
            keepalive_max: self.tuning.keepalive_max,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.tuning.host_key_policy,
            self.known_hosts.clone(),
        );

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))??;

        debug!("SSH handshake completed with {}", addr);

        self.authenticate(&mut handle).await?;

        info!("SSH authentication successful for {}", self.config.target());
        Ok(SshSession::new(handle, self.config.target()))
    }

    /// Try each configured method in order; the last failure is reported
    async fn authenticate(&self, handle: &mut client::Handle<ClientHandler>) -> Result<(), SshError> {
        if self.config.auth.is_empty() {
            return Err(SshError::AuthenticationFailed(
                "No authentication method configured".to_string(),
            ));
        }

        let mut last_error = None;
        for method in &self.config.auth {
            match self.try_method(handle, method).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    debug!("{} authentication rejected for {}", method.name(), self.config.target());
                    last_error = Some(SshError::AuthenticationFailed(format!(
                        "{} authentication rejected by server",
                        method.name()
                    )));
                }
                Err(e) => {
                    warn!("{} authentication failed for {}: {}", method.name(), self.config.target(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SshError::AuthenticationFailed("Authentication rejected by server".to_string())
        }))
    }

    async fn try_method(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        method: &AuthMethod,
    ) -> Result<bool, SshError> {
        let result = match method {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password.as_str())
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref().map(|p| p.as_str()))
                    .map_err(|e| SshError::KeyError(format!("{}: {}", key_path, e)))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };
        Ok(result.success())
    }
}

/// russh callback handler; applies the host key policy
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHostsStore>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            host,
            port,
            policy,
            known_hosts,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::Insecure {
            warn!(
                "Host key checking disabled, accepting {} for {}:{}",
                KnownHostsStore::fingerprint(server_public_key),
                self.host,
                self.port
            );
            return Ok(true);
        }

        match self.known_hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => match self.policy {
                HostKeyPolicy::Strict => {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}), strict policy rejects it",
                        self.host, self.port, fingerprint
                    );
                    Err(SshError::HostKeyRejected(format!(
                        "unknown host {}:{} ({}); add it to known_hosts",
                        self.host, self.port, fingerprint
                    )))
                }
                _ => {
                    info!(
                        "New host {}:{}, adding to known_hosts (fingerprint: {})",
                        self.host, self.port, fingerprint
                    );
                    if let Err(e) = self.known_hosts.add_host(&self.host, self.port, server_public_key) {
                        warn!("Failed to save host key: {}", e);
                    }
                    Ok(true)
                }
            },
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} has changed (expected {}, got {})",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}

/// [`Connector`] backed by russh
pub struct RusshConnector {
    tuning: SshTuning,
    known_hosts: Arc<KnownHostsStore>,
}

impl RusshConnector {
    pub fn new(tuning: SshTuning) -> Self {
        let path = tuning
            .known_hosts_path
            .clone()
            .unwrap_or_else(KnownHostsStore::default_path);
        Self {
            known_hosts: Arc::new(KnownHostsStore::open(path)),
            tuning,
        }
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn Transport>, SshError> {
        let session = SshClient::new(config.clone(), self.tuning.clone(), self.known_hosts.clone())
            .connect()
            .await?;
        Ok(Arc::new(session.start()))
    }
}
