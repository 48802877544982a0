//! SSH Configuration

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Resolved connection target with decrypted credentials
///
/// Built per connection from a registry record; never persisted.
#[derive(Clone)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication methods, tried in order until one succeeds
    pub auth: Vec<AuthMethod>,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: Vec::new(),
        }
    }

    pub fn with_auth(mut self, method: AuthMethod) -> Self {
        self.auth.push(method);
        self
    }

    /// `user@host:port`, for logs
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .finish()
    }
}

/// Authentication methods supported
#[derive(Clone)]
pub enum AuthMethod {
    /// Password authentication
    Password { password: Zeroizing<String> },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<Zeroizing<String>>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase: passphrase.map(Zeroizing::new),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "publickey",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password(<redacted>)"),
            AuthMethod::Key { key_path, .. } => write!(f, "Key({})", key_path),
        }
    }
}

/// How unknown and changed host keys are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Only hosts already in known_hosts are accepted
    Strict,
    /// Unknown hosts are trusted and recorded; changed keys are rejected
    #[default]
    AcceptNew,
    /// Every key is accepted and nothing is recorded
    Insecure,
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "accept-new" | "accept_new" => Ok(Self::AcceptNew),
            "insecure" | "off" => Ok(Self::Insecure),
            other => Err(format!("unknown host key policy: {}", other)),
        }
    }
}

/// Transport-level tuning shared by every connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTuning {
    /// TCP connect plus handshake timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// SSH keepalive interval
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Missed keepalives before the transport is dropped
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// Defaults to `~/.ssh/known_hosts`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_keepalive_interval() -> u64 {
    15
}

fn default_keepalive_max() -> usize {
    3
}

impl Default for SshTuning {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
        }
    }
}

/// PTY dimensions for interactive shells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    #[serde(default = "default_cols")]
    pub cols: u32,
    #[serde(default = "default_rows")]
    pub rows: u32,
}

fn default_cols() -> u32 {
    200
}

fn default_rows() -> u32 {
    50
}

impl Default for PtySize {
    fn default() -> Self {
        Self {
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}
