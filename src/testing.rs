//! In-process fakes for the transport seam

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::pool::{ConnectionPool, PoolOptions};
use crate::registry::{MemoryRegistry, ServerRecord};
use crate::session::{RetryConfig, ShellConfig};
use crate::ssh::{
    Connector, ExecEvent, ExecStream, OutputStream, PtySize, ShellChannel, SshConfig, SshError,
    Transport,
};
use crate::vault::CredentialVault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FakeMode {
    Ok,
    Unreachable,
    AuthFailure,
    /// Refuse the first n attempts, then connect
    FailFirst(u32),
}

pub(crate) struct FakeConnector {
    mode: Mutex<FakeMode>,
    attempts: AtomicU32,
    closed: Arc<AtomicUsize>,
    connect_delay: Option<Duration>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    last_config: Mutex<Option<SshConfig>>,
    host: Arc<FakeHost>,
}

/// Remote-side state shared by every transport of one connector
#[derive(Default)]
pub(crate) struct FakeHost {
    /// Running processes; the flag is set when the process ignores SIGTERM
    processes: Mutex<HashMap<u32, bool>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    spawned: AtomicU32,
}

impl FakeHost {
    fn spawn_pid(&self) -> u32 {
        4242 + self.spawned.fetch_add(1, Ordering::SeqCst)
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.files.lock().insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.processes.lock().contains_key(&pid)
    }

    /// Apply `kill -<signal> <pid>`; false if there is no such process
    fn signal(&self, signal: &str, pid: u32) -> bool {
        let mut processes = self.processes.lock();
        match (signal, processes.get(&pid).copied()) {
            (_, None) => false,
            ("0", Some(_)) | ("TERM", Some(true)) => true,
            _ => processes.remove(&pid).is_some(),
        }
    }
}

/// A process started by a hanging command
///
/// Dropping the exec stream closes the channel, which sends SIGTERM.
struct FakeProcess {
    host: Arc<FakeHost>,
    pid: u32,
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.host.signal("TERM", self.pid);
    }
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::with_mode(FakeMode::Ok)
    }

    pub fn with_mode(mode: FakeMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            attempts: AtomicU32::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            connect_delay: None,
            transports: Mutex::new(Vec::new()),
            last_config: Mutex::new(None),
            host: Arc::new(FakeHost::default()),
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn set_mode(&self, mode: FakeMode) {
        *self.mode.lock() = mode;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Calls to `Transport::close` across all transports
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Transports handed out so far, oldest first
    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }

    pub fn host(&self) -> &Arc<FakeHost> {
        &self.host
    }

    pub fn last_config(&self) -> Option<SshConfig> {
        self.last_config.lock().clone()
    }

    /// Drop every connection as if the network went away
    pub fn kill_all(&self) {
        for transport in self.transports.lock().iter() {
            transport.kill();
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn Transport>, SshError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_config.lock() = Some(config.clone());

        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        let mode = *self.mode.lock();
        match mode {
            FakeMode::Unreachable => {
                return Err(SshError::ConnectionFailed("connection refused".to_string()))
            }
            FakeMode::AuthFailure => {
                return Err(SshError::AuthenticationFailed(
                    "all methods rejected".to_string(),
                ))
            }
            FakeMode::FailFirst(n) if attempt <= n => {
                return Err(SshError::ConnectionFailed("connection reset".to_string()))
            }
            _ => {}
        }

        let transport = Arc::new(FakeTransport {
            connected: AtomicBool::new(true),
            panicking: AtomicBool::new(false),
            closed: self.closed.clone(),
            host: self.host.clone(),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

pub(crate) struct FakeTransport {
    connected: AtomicBool,
    panicking: AtomicBool,
    closed: Arc<AtomicUsize>,
    host: Arc<FakeHost>,
}

impl FakeTransport {
    pub fn kill(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Make `is_connected` panic
    pub fn set_panicking(&self, panicking: bool) {
        self.panicking.store(panicking, Ordering::SeqCst);
    }

    fn check_connected(&self) -> Result<(), SshError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SshError::Disconnected)
        }
    }
}

/// Undo one level of POSIX single quoting
fn unquote(s: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => loop {
                match chars.next()? {
                    '\'' => break,
                    c => out.push(c),
                }
            },
            '\\' => out.push(chars.next()?),
            c => out.push(c),
        }
    }
    Some(out)
}

/// The user command inside a PID-echo wrapper
fn unwrap_pid_echo(command: &str) -> Option<String> {
    let inner = unquote(command.strip_prefix("sh -c ")?)?;
    unquote(inner.strip_prefix("echo $$; exec sh -c ")?)
}

fn parse_kill(command: &str) -> Option<(&str, u32)> {
    let mut parts = command.strip_prefix("kill -")?.split(' ');
    let signal = parts.next()?;
    let pid = parts.next()?.parse().ok()?;
    Some((signal, pid))
}

#[async_trait]
impl Transport for FakeTransport {
    async fn exec(&self, command: &str) -> Result<ExecStream, SshError> {
        self.check_connected()?;

        let out = |stream, data: &[u8]| ExecEvent::Output {
            stream,
            data: data.to_vec(),
        };
        let (command, pid) = match unwrap_pid_echo(command) {
            Some(inner) => (inner, Some(self.host.spawn_pid())),
            None => (command.to_string(), None),
        };
        let command = command.as_str();
        let mut events: Vec<ExecEvent> = pid
            .map(|pid| out(OutputStream::Stdout, format!("{}\n", pid).as_bytes()))
            .into_iter()
            .collect();

        // `hang` runs until its channel is closed; `stubborn` also ignores SIGTERM
        if command == "hang" || command == "stubborn" {
            let pid = pid.unwrap_or_else(|| self.host.spawn_pid());
            self.host.processes.lock().insert(pid, command == "stubborn");
            let process = FakeProcess {
                host: self.host.clone(),
                pid,
            };
            let running = stream::iter(events.into_iter().map(Ok))
                .chain(stream::pending())
                .map(move |event| {
                    let _ = &process;
                    event
                });
            return Ok(running.boxed());
        }

        events.extend(if let Some((signal, pid)) = parse_kill(command) {
            if self.host.signal(signal, pid) {
                vec![ExecEvent::Exit(Some(0))]
            } else {
                vec![
                    out(
                        OutputStream::Stderr,
                        format!("kill: ({}) - No such process\n", pid).as_bytes(),
                    ),
                    ExecEvent::Exit(Some(1)),
                ]
            }
        } else if let Some(text) = command.strip_prefix("echo ") {
            vec![
                out(OutputStream::Stdout, format!("{}\n", text).as_bytes()),
                ExecEvent::Exit(Some(0)),
            ]
        } else if let Some(text) = command.strip_prefix("fail ") {
            vec![
                out(OutputStream::Stderr, format!("{}\n", text).as_bytes()),
                ExecEvent::Exit(Some(1)),
            ]
        } else if command == "utf8" {
            // Split inside the two-byte 'é'
            let bytes = "héllo wörld\n".as_bytes();
            vec![
                out(OutputStream::Stdout, &bytes[..2]),
                out(OutputStream::Stdout, &bytes[2..]),
                ExecEvent::Exit(Some(0)),
            ]
        } else {
            vec![
                out(
                    OutputStream::Stderr,
                    format!("{}: command not found\n", command).as_bytes(),
                ),
                ExecEvent::Exit(Some(127)),
            ]
        });

        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64, SshError> {
        self.check_connected()?;
        if remote.starts_with("/hang/") {
            std::future::pending::<()>().await;
        }

        let data = self
            .host
            .file(remote)
            .ok_or_else(|| SshError::Sftp(format!("{}: No such file", remote)))?;
        tokio::fs::write(local, &data).await?;
        Ok(data.len() as u64)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, SshError> {
        self.check_connected()?;
        if remote.starts_with("/hang/") {
            std::future::pending::<()>().await;
        }

        let data = tokio::fs::read(local).await?;
        self.host.put_file(remote, &data);
        Ok(data.len() as u64)
    }

    async fn open_shell(&self, _pty: PtySize) -> Result<Box<dyn ShellChannel>, SshError> {
        self.check_connected()?;
        Ok(Box::new(FakeShell::new()))
    }

    fn is_connected(&self) -> bool {
        if self.panicking.load(Ordering::SeqCst) {
            panic!("fake transport check exploded");
        }
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

const PRINTF_MARKER: &str = "printf '__SHELLFLEET_%s__\\n' ";

/// A tiny line-oriented shell behind a PTY
///
/// Understands `echo`, `cd`, `pwd`, `exit`, `stty -echo` and the marker
/// `printf`. `slow X` holds back its output, and everything after it in the
/// same write, until the next write.
pub(crate) struct FakeShell {
    echo: bool,
    /// `stty -echo` has no effect
    sticky_echo: bool,
    prompt: String,
    cwd: String,
    partial: String,
    outbox: VecDeque<Vec<u8>>,
    deferred: String,
    closed: bool,
}

impl FakeShell {
    pub fn new() -> Self {
        let prompt = "user@host:~$ ".to_string();
        let mut outbox = VecDeque::new();
        outbox.push_back(prompt.as_bytes().to_vec());
        Self {
            echo: true,
            sticky_echo: false,
            prompt,
            cwd: "/root".to_string(),
            partial: String::new(),
            outbox,
            deferred: String::new(),
            closed: false,
        }
    }

    pub fn with_sticky_echo(mut self) -> Self {
        self.sticky_echo = true;
        self
    }

    fn execute(&mut self, line: &str, out: &mut String, slow: &mut bool) {
        let line = line.trim_end_matches('\r');
        if self.echo {
            out.push_str(line);
            out.push_str("\r\n");
        }

        let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
        match cmd {
            "" => {}
            "stty" if arg.starts_with("-echo") => {
                self.echo = self.sticky_echo;
                self.prompt.clear();
            }
            "printf" => {
                if let Some(token) = line.strip_prefix(PRINTF_MARKER) {
                    out.push_str(&format!("__SHELLFLEET_{}__\r\n", token.trim()));
                }
            }
            "echo" => {
                out.push_str(arg);
                out.push_str("\r\n");
            }
            "cd" => self.cwd = arg.to_string(),
            "pwd" => {
                out.push_str(&self.cwd);
                out.push_str("\r\n");
            }
            "slow" => {
                *slow = true;
                self.deferred.push_str(arg);
                self.deferred.push_str("\r\n");
            }
            "exit" => {
                self.closed = true;
                return;
            }
            other => out.push_str(&format!("{}: command not found\r\n", other)),
        }

        out.push_str(&self.prompt);
    }
}

#[async_trait]
impl ShellChannel for FakeShell {
    async fn write(&mut self, data: &[u8]) -> Result<(), SshError> {
        if self.closed {
            return Err(SshError::ChannelError("shell closed".to_string()));
        }

        let mut out = std::mem::take(&mut self.deferred);
        self.partial.push_str(&String::from_utf8_lossy(data));

        let mut slow = false;
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim_end_matches('\n').to_string();

            if slow {
                let mut held = String::new();
                self.execute(&line, &mut held, &mut slow);
                self.deferred.push_str(&held);
            } else {
                self.execute(&line, &mut out, &mut slow);
                if slow {
                    // Output of the slow line itself already went to `deferred`;
                    // move its trailing prompt there too
                    let prompt_len = self.prompt.len();
                    if prompt_len > 0 && out.ends_with(&self.prompt) {
                        out.truncate(out.len() - prompt_len);
                        self.deferred.push_str(&self.prompt);
                    }
                }
            }
            if self.closed {
                break;
            }
        }

        if !out.is_empty() {
            self.outbox.push_back(out.into_bytes());
        }
        Ok(())
    }

    async fn read(&mut self) -> Option<Vec<u8>> {
        if let Some(chunk) = self.outbox.pop_front() {
            return Some(chunk);
        }
        if self.closed {
            return None;
        }
        std::future::pending().await
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

pub(crate) struct PoolHarness {
    pub _temp: TempDir,
    pub vault: Arc<CredentialVault>,
    pub registry: Arc<MemoryRegistry>,
    pub connector: Arc<FakeConnector>,
    pub pool: Arc<ConnectionPool>,
}

/// A pool over a fresh vault and a registry holding `web` and `db`
pub(crate) fn pool_harness(connector: FakeConnector, options: PoolOptions) -> PoolHarness {
    let temp = tempfile::tempdir().unwrap();
    let vault = Arc::new(CredentialVault::open(temp.path().join("encryption.key")).unwrap());
    let registry = Arc::new(MemoryRegistry::new());
    for alias in ["web", "db"] {
        registry.insert(
            ServerRecord::new(alias, format!("{}.internal", alias), "root")
                .with_password(vault.encrypt("hunter2").unwrap()),
        );
    }

    let connector = Arc::new(connector);
    let pool = Arc::new(ConnectionPool::new(
        registry.clone(),
        vault.clone(),
        connector.clone(),
        options,
    ));

    PoolHarness {
        _temp: temp,
        vault,
        registry,
        connector,
        pool,
    }
}

/// Short retry backoff and shell timeouts
pub(crate) fn fast_pool_options() -> PoolOptions {
    PoolOptions {
        retry: RetryConfig::new(3).with_backoff(10, 2.0, 100),
        shell: ShellConfig {
            command_timeout_ms: 200,
            prompt_timeout_ms: 200,
            ..Default::default()
        },
        ..Default::default()
    }
}
