//! Connection Pool
//!
//! At most one live [`Session`] per alias.
//!
//! ```text
//! ConnectionPool
//!   slots: DashMap<alias, Arc<Mutex<Option<Session>>>>
//!            │
//!            ├── "web" ──► Mutex ──► Some(Session)   (guard held by a running command)
//!            └── "db"  ──► Mutex ──► Some(Session)
//! ```
//!
//! # Locking
//!
//! Each alias has its own async mutex. Lookup, creation, connection, use and
//! eviction of one alias all happen under it, so two concurrent requests for
//! the same alias can never both create a session. A slot is only removed from
//! the map by whoever holds its mutex; a task that wakes up holding a slot that
//! is no longer in the map starts over.
//!
//! The map's shard locks are never held across an `.await`.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::breaker::{BreakerConfig, CircuitBreaker};
use crate::registry::{RegistryError, ServerRecord, ServerRegistry};
use crate::session::{
    CommandOptions, CommandOutput, CommandStream, ConnectionError, RetryConfig, Session,
    SessionError, ShellConfig,
};
use crate::ssh::{AuthMethod, Connector, OutputStream, SshConfig, SshError};
use crate::vault::{CredentialVault, VaultError};

pub(crate) type Slot = Arc<Mutex<Option<Session>>>;

/// Exclusive access to one pooled session
///
/// The alias stays locked until this guard is dropped.
pub type PooledSession = OwnedMappedMutexGuard<Option<Session>, Session>;

/// Pool timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Sessions unused for longer than this are closed by the health check
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Interval between health check passes
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Upper bound for checking or closing one session during a pass
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,

    /// Default deadline for one-shot commands; 0 disables it
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Upper bound for one file transfer
    #[serde(default = "default_sftp_timeout_secs")]
    pub sftp_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_check_timeout_secs() -> u64 {
    10
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_sftp_timeout_secs() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            health_interval_secs: default_health_interval_secs(),
            check_timeout_secs: default_check_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            sftp_timeout_secs: default_sftp_timeout_secs(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    pub fn sftp_timeout(&self) -> Duration {
        Duration::from_secs(self.sftp_timeout_secs)
    }
}

/// Everything the pool needs to build sessions
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub shell: ShellConfig,
    pub breaker: BreakerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Unknown server alias: {0}")]
    UnknownAlias(String),

    #[error("Server {0} has neither a password nor a key path configured")]
    MissingCredentials(String),

    #[error("Circuit breaker open for {alias}, retry in {}s", retry_in.as_secs())]
    CircuitOpen { alias: String, retry_in: Duration },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Credential error: {0}")]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("No active shell session for {0}. Start one first.")]
    NoActiveShell(String),

    #[error("{operation} on {alias} timed out after {}s", after.as_secs())]
    TimedOut {
        alias: String,
        operation: &'static str,
        after: Duration,
    },

    #[error("Session error: {0}")]
    Session(SessionError),
}

impl From<SessionError> for PoolError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Connection(e) => PoolError::Connection(e),
            SessionError::NoActiveShell(alias) => PoolError::NoActiveShell(alias),
            other => PoolError::Session(other),
        }
    }
}

/// Collected output of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<u32>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// What [`ConnectionPool::kill_process`] had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillOutcome {
    /// No such process when SIGTERM was sent
    NotRunning,
    /// Gone within the grace period
    Terminated,
    /// Still alive after the grace period, so SIGKILL was sent
    Killed,
}

/// Pool occupancy snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub connected_sessions: usize,
    pub shell_sessions: usize,
    /// Slots locked by a caller at the time of the snapshot
    pub busy_sessions: usize,
}

/// Command output stream that keeps its session locked until dropped
pub struct PooledStream {
    inner: CommandStream,
    _session: PooledSession,
}

impl Stream for PooledStream {
    type Item = Result<CommandOutput, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

pub struct ConnectionPool {
    pub(crate) slots: DashMap<String, Slot>,
    registry: Arc<dyn ServerRegistry>,
    vault: Arc<CredentialVault>,
    connector: Arc<dyn Connector>,
    pub(crate) options: PoolOptions,
    breaker: CircuitBreaker,
    pub(crate) health_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        registry: Arc<dyn ServerRegistry>,
        vault: Arc<CredentialVault>,
        connector: Arc<dyn Connector>,
        options: PoolOptions,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            registry,
            vault,
            connector,
            breaker: CircuitBreaker::new(options.breaker.clone()),
            options,
            health_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Whether `slot` is still the one registered for `alias`
    pub(crate) fn is_current(&self, alias: &str, slot: &Slot) -> bool {
        self.slots
            .get(alias)
            .map(|current| Arc::ptr_eq(current.value(), slot))
            .unwrap_or(false)
    }

    /// Remove `slot` from the map unless it has already been replaced
    pub(crate) fn forget_slot(&self, alias: &str, slot: &Slot) {
        self.slots
            .remove_if(alias, |_, current| Arc::ptr_eq(current, slot));
    }

    /// The live session for `alias`, creating and connecting one if needed
    ///
    /// A failed connect leaves nothing in the pool.
    pub async fn get_or_create(&self, alias: &str) -> Result<PooledSession, PoolError> {
        loop {
            let slot = self.slots.entry(alias.to_string()).or_default().clone();
            let mut guard = slot.clone().lock_owned().await;

            if !self.is_current(alias, &slot) {
                debug!("Slot for {} was evicted while waiting, retrying", alias);
                continue;
            }

            match guard.as_ref().map(Session::is_connected) {
                Some(true) => return into_pooled(guard),
                Some(false) => {
                    info!("Pooled session for {} is no longer connected, replacing it", alias);
                    if let Some(mut stale) = guard.take() {
                        stale.close().await;
                    }
                }
                None => {}
            }

            match self.open_session(alias).await {
                Ok(session) => {
                    *guard = Some(session);
                    return into_pooled(guard);
                }
                Err(e) => {
                    self.forget_slot(alias, &slot);
                    return Err(e);
                }
            }
        }
    }

    /// Resolve the registry record and connect a new session
    async fn open_session(&self, alias: &str) -> Result<Session, PoolError> {
        if let Err(retry_in) = self.breaker.check(alias) {
            return Err(PoolError::CircuitOpen {
                alias: alias.to_string(),
                retry_in,
            });
        }

        let record = self
            .registry
            .get(alias)
            .await?
            .ok_or_else(|| PoolError::UnknownAlias(alias.to_string()))?;
        let target = self.resolve_target(&record)?;

        let mut session = Session::new(
            alias,
            target,
            self.connector.clone(),
            self.options.retry.clone(),
            self.options.shell.clone(),
        );

        match session.connect().await {
            Ok(()) => {
                self.breaker.record_success(alias);
                Ok(session)
            }
            Err(e) => {
                self.breaker.record_failure(alias);
                Err(e.into())
            }
        }
    }

    /// Decrypt the record's secrets into an SSH target; key before password
    fn resolve_target(&self, record: &ServerRecord) -> Result<SshConfig, PoolError> {
        if !record.has_credentials() {
            return Err(PoolError::MissingCredentials(record.alias.clone()));
        }

        let mut target = SshConfig::new(&record.hostname, record.port, &record.user);
        if let Some(secret) = &record.encrypted_key_path {
            let key_path = self.vault.decrypt(secret)?;
            target = target.with_auth(AuthMethod::key(key_path.as_str(), None));
        }
        if let Some(secret) = &record.encrypted_password {
            let password = self.vault.decrypt(secret)?;
            target = target.with_auth(AuthMethod::password(password.as_str()));
        }
        Ok(target)
    }

    /// Options for commands that do not bring their own
    pub fn default_command_options(&self) -> CommandOptions {
        CommandOptions {
            timeout: self.options.pool.command_timeout(),
            capture_pid: false,
        }
    }

    /// Run a command, streaming its output
    ///
    /// The session stays locked for as long as the returned stream lives.
    /// The configured command timeout applies.
    pub async fn run_command(&self, alias: &str, command: &str) -> Result<PooledStream, PoolError> {
        self.run_command_with(alias, command, &self.default_command_options())
            .await
    }

    /// [`Self::run_command`] with explicit options
    ///
    /// Dropping the stream cancels the command: its channel is closed and the
    /// remote process is sent SIGTERM.
    pub async fn run_command_with(
        &self,
        alias: &str,
        command: &str,
        options: &CommandOptions,
    ) -> Result<PooledStream, PoolError> {
        let mut session = self.get_or_create(alias).await?;
        match session.run_command_with(command, options).await {
            Ok(inner) => Ok(PooledStream {
                inner,
                _session: session,
            }),
            Err(e) => {
                warn!("Command on {} failed to start: {}", alias, e);
                Err(e.into())
            }
        }
    }

    /// Run a command and wait for all of its output
    pub async fn run_command_collect(
        &self,
        alias: &str,
        command: &str,
    ) -> Result<CommandResult, PoolError> {
        let stream = self.run_command(alias, command).await?;
        collect_output(stream).await
    }

    /// Signal `pid` on `alias` with SIGTERM, then SIGKILL if it outlives `grace`
    ///
    /// Runs on a connection of its own, so a command still streaming on the
    /// pooled session does not block it. The whole exchange is bounded by the
    /// command timeout.
    pub async fn kill_process(
        &self,
        alias: &str,
        pid: u32,
        grace: Duration,
    ) -> Result<KillOutcome, PoolError> {
        let mut session = self.open_session(alias).await?;
        let limit = self.options.pool.command_timeout();
        let signalled = signal_process(&mut session, pid, grace);
        let outcome = bounded(alias, "kill", limit, signalled).await;
        session.close().await;

        match &outcome {
            Ok(outcome) => info!("kill {} on {}: {:?}", pid, alias, outcome),
            Err(e) => warn!("kill {} on {} failed: {}", pid, alias, e),
        }
        outcome
    }

    /// Copy `remote` on `alias` into the local file `local`
    pub async fn download_file(
        &self,
        alias: &str,
        remote: &str,
        local: &Path,
    ) -> Result<u64, PoolError> {
        let mut session = self.get_or_create(alias).await?;
        let limit = Some(self.options.pool.sftp_timeout());
        let copied = async { session.download(remote, local).await.map_err(PoolError::from) };
        bounded(alias, "download", limit, copied).await
    }

    /// Copy the local file `local` to `remote` on `alias`
    pub async fn upload_file(&self, alias: &str, local: &Path, remote: &str) -> Result<u64, PoolError> {
        let mut session = self.get_or_create(alias).await?;
        let limit = Some(self.options.pool.sftp_timeout());
        let copied = async { session.upload(local, remote).await.map_err(PoolError::from) };
        bounded(alias, "upload", limit, copied).await
    }

    /// Open the interactive shell for `alias`, connecting first if needed
    pub async fn start_shell_session(&self, alias: &str) -> Result<(), PoolError> {
        let mut session = self.get_or_create(alias).await?;
        session.start_shell().await?;
        Ok(())
    }

    /// Run a command in the shell opened by [`Self::start_shell_session`]
    ///
    /// Never connects on its own: without a pooled session holding an open
    /// shell this is `NoActiveShell`.
    pub async fn run_command_in_shell(&self, alias: &str, command: &str) -> Result<String, PoolError> {
        loop {
            let slot = match self.slots.get(alias) {
                Some(slot) => slot.value().clone(),
                None => return Err(PoolError::NoActiveShell(alias.to_string())),
            };
            let mut guard = slot.clone().lock_owned().await;
            if !self.is_current(alias, &slot) {
                continue;
            }

            return match guard.as_mut() {
                Some(session) => Ok(session.run_in_shell(command).await?),
                None => Err(PoolError::NoActiveShell(alias.to_string())),
            };
        }
    }

    /// Close and remove the session for `alias`; false if there was none
    pub async fn disconnect(&self, alias: &str) -> bool {
        let Some((_, slot)) = self.slots.remove(alias) else {
            return false;
        };

        let mut guard = slot.lock().await;
        match guard.take() {
            Some(mut session) => {
                session.close().await;
                info!("Disconnected {}", alias);
                true
            }
            None => false,
        }
    }

    /// Close every pooled session
    pub async fn close_all(&self) {
        let aliases = self.aliases();
        info!("Closing all {} pooled sessions", aliases.len());
        for alias in aliases {
            self.disconnect(&alias).await;
        }
    }

    /// Stop the health check and close everything
    pub async fn shutdown(&self) {
        self.stop_health_check();
        self.close_all().await;
    }

    /// Aliases with a pooled slot, sorted
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        aliases.sort();
        aliases
    }

    pub fn stats(&self) -> PoolStats {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut stats = PoolStats {
            total_sessions: slots.len(),
            ..Default::default()
        };

        for slot in slots {
            match slot.try_lock() {
                Ok(guard) => {
                    if let Some(session) = guard.as_ref() {
                        if session.is_connected() {
                            stats.connected_sessions += 1;
                        }
                        if session.has_shell() {
                            stats.shell_sessions += 1;
                        }
                    }
                }
                Err(_) => stats.busy_sessions += 1,
            }
        }
        stats
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn collect_output<S>(mut stream: S) -> Result<CommandResult, PoolError>
where
    S: Stream<Item = Result<CommandOutput, SessionError>> + Unpin,
{
    let mut result = CommandResult::default();
    while let Some(item) = stream.next().await {
        match item? {
            CommandOutput::Chunk(chunk) => match chunk.stream {
                OutputStream::Stdout => result.stdout.push_str(&chunk.text),
                OutputStream::Stderr => result.stderr.push_str(&chunk.text),
            },
            CommandOutput::Exit { status } => result.exit_status = status,
            CommandOutput::Pid(_) => {}
        }
    }
    Ok(result)
}

/// `kill -<signal> <pid>`; false if there was no such process
async fn send_signal(session: &mut Session, signal: &str, pid: u32) -> Result<bool, PoolError> {
    let stream = session
        .run_command(&format!("kill -{} {}", signal, pid))
        .await?;
    Ok(collect_output(stream).await?.success())
}

async fn signal_process(
    session: &mut Session,
    pid: u32,
    grace: Duration,
) -> Result<KillOutcome, PoolError> {
    if !send_signal(session, "TERM", pid).await? {
        return Ok(KillOutcome::NotRunning);
    }
    tokio::time::sleep(grace).await;
    if !send_signal(session, "0", pid).await? {
        return Ok(KillOutcome::Terminated);
    }
    // It may still exit between the check and the kill
    Ok(if send_signal(session, "KILL", pid).await? {
        KillOutcome::Killed
    } else {
        KillOutcome::Terminated
    })
}

/// Run `work`, giving up after `limit`
async fn bounded<T, F>(
    alias: &str,
    operation: &'static str,
    limit: Option<Duration>,
    work: F,
) -> Result<T, PoolError>
where
    F: Future<Output = Result<T, PoolError>>,
{
    let Some(limit) = limit else {
        return work.await;
    };
    tokio::time::timeout(limit, work)
        .await
        .unwrap_or_else(|_| {
            warn!("{} on {} timed out after {:?}", operation, alias, limit);
            Err(PoolError::TimedOut {
                alias: alias.to_string(),
                operation,
                after: limit,
            })
        })
}

fn into_pooled(guard: OwnedMutexGuard<Option<Session>>) -> Result<PooledSession, PoolError> {
    OwnedMutexGuard::try_map(guard, |slot| slot.as_mut())
        .map_err(|_| PoolError::Session(SessionError::Transport(SshError::Disconnected)))
}
