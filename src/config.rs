//! Runtime configuration
//!
//! Everything has a default. `SHELLFLEET_*` environment variables override
//! individual values; a malformed value is an error rather than silently
//! falling back.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::pool::{BreakerConfig, PoolConfig, PoolOptions};
use crate::session::{RetryConfig, ShellConfig, ShellFraming};
use crate::ssh::{HostKeyPolicy, SshTuning};

pub const ENV_PREFIX: &str = "SHELLFLEET_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Encryption key file
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    /// Server registry file
    #[serde(default = "default_registry_file")]
    pub registry_file: PathBuf,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub shell: ShellConfig,

    #[serde(default)]
    pub ssh: SshTuning,

    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_key_file() -> PathBuf {
    PathBuf::from("var").join("encryption.key")
}

fn default_registry_file() -> PathBuf {
    PathBuf::from("var").join("servers.json")
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
            registry_file: default_registry_file(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            shell: ShellConfig::default(),
            ssh: SshTuning::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden through `lookup`, which receives full variable names
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(path) = env.raw("KEY_FILE") {
            config.key_file = PathBuf::from(path);
        }
        if let Some(path) = env.raw("REGISTRY_FILE") {
            config.registry_file = PathBuf::from(path);
        }

        env.set("IDLE_TIMEOUT", &mut config.pool.idle_timeout_secs)?;
        env.set("HEALTH_INTERVAL", &mut config.pool.health_interval_secs)?;
        env.set("CHECK_TIMEOUT", &mut config.pool.check_timeout_secs)?;
        env.set("EXEC_TIMEOUT", &mut config.pool.command_timeout_secs)?;
        env.set("SFTP_TIMEOUT", &mut config.pool.sftp_timeout_secs)?;

        env.set("RETRY_ATTEMPTS", &mut config.retry.max_attempts)?;
        env.set("RETRY_BACKOFF_MS", &mut config.retry.initial_backoff_ms)?;
        env.set("RETRY_MAX_BACKOFF_MS", &mut config.retry.max_backoff_ms)?;
        env.set("RETRY_JITTER", &mut config.retry.jitter)?;

        env.set("CONNECT_TIMEOUT", &mut config.ssh.connect_timeout_secs)?;
        env.set("KEEPALIVE_INTERVAL", &mut config.ssh.keepalive_interval_secs)?;
        env.set("KEEPALIVE_COUNT", &mut config.ssh.keepalive_max)?;
        env.set::<HostKeyPolicy>("HOST_KEY_POLICY", &mut config.ssh.host_key_policy)?;
        if let Some(path) = env.raw("KNOWN_HOSTS") {
            config.ssh.known_hosts_path = Some(PathBuf::from(path));
        }

        env.set::<ShellFraming>("SHELL_FRAMING", &mut config.shell.framing)?;
        if let Some(pattern) = env.raw("PROMPT_PATTERN") {
            regex::Regex::new(&pattern).map_err(|e| ConfigError::InvalidValue {
                var: format!("{}PROMPT_PATTERN", ENV_PREFIX),
                value: pattern.clone(),
                reason: e.to_string(),
            })?;
            config.shell.prompt_pattern = pattern;
        }
        env.set("PROMPT_TIMEOUT_MS", &mut config.shell.prompt_timeout_ms)?;
        env.set("COMMAND_TIMEOUT_MS", &mut config.shell.command_timeout_ms)?;

        env.set("BREAKER_FAILS", &mut config.breaker.fail_threshold)?;
        env.set("BREAKER_COOL_OFF", &mut config.breaker.cool_off_secs)?;

        Ok(config)
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            pool: self.pool.clone(),
            retry: self.retry.clone(),
            shell: self.shell.clone(),
            breaker: self.breaker.clone(),
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, name))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn set<T>(&self, name: &str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.raw(name) {
            *slot = value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                var: format!("{}{}", ENV_PREFIX, name),
                value: value.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}
