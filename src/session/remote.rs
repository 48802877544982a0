//! One logical connection to one remote host

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::command::{with_pid_echo, CommandOptions};
use super::error::{ConnectionError, SessionError};
use super::output::{decode_command_stream, CommandStream};
use super::retry::{calculate_backoff, RetryConfig};
use super::shell::{ShellConfig, ShellDriver};
use super::state::SessionState;
use crate::ssh::{Connector, SshConfig, SshError, Transport};

/// Why a session should be dropped from the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Disconnected,
    Idle(Duration),
    /// Checking the session panicked
    CheckFailed,
}

impl std::fmt::Display for EvictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictReason::Disconnected => f.write_str("transport disconnected"),
            EvictReason::Idle(idle) => write!(f, "idle for {}s", idle.as_secs()),
            EvictReason::CheckFailed => f.write_str("health check failed"),
        }
    }
}

pub struct Session {
    id: String,
    alias: String,
    target: SshConfig,
    connector: Arc<dyn Connector>,
    retry: RetryConfig,
    shell_config: ShellConfig,
    transport: Option<Arc<dyn Transport>>,
    shell: Option<ShellDriver>,
    state: SessionState,
    last_activity: Instant,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("target", &self.target.target())
            .field("state", &self.state)
            .finish()
    }
}

impl Session {
    pub fn new(
        alias: impl Into<String>,
        target: SshConfig,
        connector: Arc<dyn Connector>,
        retry: RetryConfig,
        shell_config: ShellConfig,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            alias: alias.into(),
            target,
            connector,
            retry,
            shell_config,
            transport: None,
            shell: None,
            state: SessionState::Disconnected,
            last_activity: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn has_shell(&self) -> bool {
        self.shell.is_some()
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            debug!(
                "Session {} ({}) jumping {} -> {}",
                self.id, self.alias, self.state, next
            );
        }
        self.state = next;
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .as_ref()
            .map(|t| t.is_connected())
            .unwrap_or(false)
    }

    /// Whether the pool should drop this session at `now`
    pub fn eviction_reason(&self, now: Instant, idle_timeout: Duration) -> Option<EvictReason> {
        if !self.is_connected() {
            return Some(EvictReason::Disconnected);
        }
        let idle = now.saturating_duration_since(self.last_activity);
        (idle > idle_timeout).then_some(EvictReason::Idle(idle))
    }

    /// Connect unless already connected
    ///
    /// Makes up to `retry.max_attempts` attempts with exponential backoff in
    /// between. Errors that cannot be fixed by retrying end the loop early.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.transport.is_some() {
            debug!("Session {} ({}) transport is dead, reconnecting", self.id, self.alias);
            self.drop_transport();
        }

        self.set_state(SessionState::Connecting);
        let max_attempts = self.retry.attempts();
        let mut attempts = 0;

        let last = loop {
            attempts += 1;
            info!(
                "Connecting to {} ({}), attempt {}/{}",
                self.alias,
                self.target.target(),
                attempts,
                max_attempts
            );

            let err = match self.connector.connect(&self.target).await {
                Ok(transport) => {
                    self.transport = Some(transport);
                    self.set_state(SessionState::Connected);
                    self.touch();
                    info!("Connected to {} (session {})", self.alias, self.id);
                    return Ok(());
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                warn!("Connection to {} failed permanently: {}", self.alias, err);
                break err;
            }
            if attempts >= max_attempts {
                warn!(
                    "Connection to {} failed after {} attempts: {}",
                    self.alias, attempts, err
                );
                break err;
            }

            let delay = calculate_backoff(attempts - 1, &self.retry);
            warn!(
                "Connection to {} failed ({}), retrying in {:?}",
                self.alias, err, delay
            );
            tokio::time::sleep(delay).await;
        };

        self.set_state(SessionState::Disconnected);
        Err(ConnectionError {
            alias: self.alias.clone(),
            attempts,
            last,
        })
    }

    fn connected_transport(&self) -> Result<Arc<dyn Transport>, SessionError> {
        self.transport
            .clone()
            .ok_or(SessionError::Transport(SshError::Disconnected))
    }

    /// Forget a transport that died while `result` was produced
    fn settle<T>(
        &mut self,
        transport: &Arc<dyn Transport>,
        result: Result<T, SshError>,
    ) -> Result<T, SessionError> {
        if result.is_err() && !transport.is_connected() {
            self.drop_transport();
        }
        result.map_err(SessionError::from)
    }

    /// Run a one-shot command, streaming its output
    ///
    /// Connects first if needed. The command itself is never retried.
    pub async fn run_command(&mut self, command: &str) -> Result<CommandStream, SessionError> {
        self.run_command_with(command, &CommandOptions::default()).await
    }

    /// [`Session::run_command`] with a deadline and/or PID capture
    ///
    /// Dropping the returned stream, or running past the deadline, closes the
    /// exec channel.
    pub async fn run_command_with(
        &mut self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandStream, SessionError> {
        self.touch();
        self.connect().await?;

        let transport = self.connected_transport()?;
        debug!("Running command on {}", self.alias);
        let started = if options.capture_pid {
            transport.exec(&with_pid_echo(command)).await
        } else {
            transport.exec(command).await
        };
        let raw = self.settle(&transport, started)?;
        Ok(decode_command_stream(raw, options))
    }

    /// Copy `remote` from the host into the local file `local`
    pub async fn download(&mut self, remote: &str, local: &Path) -> Result<u64, SessionError> {
        self.touch();
        self.connect().await?;

        let transport = self.connected_transport()?;
        let copied = transport.download(remote, local).await;
        let bytes = self.settle(&transport, copied)?;
        info!("Downloaded {} bytes from {}:{}", bytes, self.alias, remote);
        Ok(bytes)
    }

    /// Copy the local file `local` to `remote` on the host
    pub async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, SessionError> {
        self.touch();
        self.connect().await?;

        let transport = self.connected_transport()?;
        let copied = transport.upload(local, remote).await;
        let bytes = self.settle(&transport, copied)?;
        info!("Uploaded {} bytes to {}:{}", bytes, self.alias, remote);
        Ok(bytes)
    }

    /// Open the interactive shell if it is not already open
    pub async fn start_shell(&mut self) -> Result<(), SessionError> {
        self.touch();
        self.connect().await?;
        if self.shell.is_some() {
            return Ok(());
        }

        let transport = self.connected_transport()?;
        let channel = transport.open_shell(self.shell_config.pty).await?;
        let driver = ShellDriver::start(&self.alias, channel, &self.shell_config).await?;

        self.shell = Some(driver);
        self.set_state(SessionState::ShellActive);
        info!("Shell started for {} (session {})", self.alias, self.id);
        Ok(())
    }

    /// Run a command in the interactive shell started by [`Session::start_shell`]
    pub async fn run_in_shell(&mut self, command: &str) -> Result<String, SessionError> {
        self.touch();
        let shell = self
            .shell
            .as_mut()
            .ok_or_else(|| SessionError::NoActiveShell(self.alias.clone()))?;

        let result = shell.run(command).await;
        if matches!(result, Err(SessionError::ShellClosed(_))) {
            warn!("Shell for {} closed, dropping it", self.alias);
            self.shell = None;
            self.set_state(if self.is_connected() {
                SessionState::Connected
            } else {
                SessionState::Disconnected
            });
        }
        result
    }

    pub async fn close_shell(&mut self) {
        if let Some(mut shell) = self.shell.take() {
            shell.close().await;
            if self.state == SessionState::ShellActive {
                self.set_state(SessionState::Connected);
            }
            debug!("Shell closed for {}", self.alias);
        }
    }

    /// Close the shell and the transport, waiting for teardown
    pub async fn close(&mut self) {
        self.close_shell().await;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
            info!("Session {} ({}) closed", self.id, self.alias);
        }
        self.set_state(SessionState::Disconnected);
    }

    fn drop_transport(&mut self) {
        self.shell = None;
        self.transport = None;
        self.set_state(SessionState::Disconnected);
    }
}
