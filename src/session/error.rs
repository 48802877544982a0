//! Session error types

use std::time::Duration;

use thiserror::Error;

use crate::ssh::SshError;

/// Every connection attempt for `alias` failed
#[derive(Debug, Error)]
#[error("Could not connect to {alias} after {attempts} attempt(s): {last}")]
pub struct ConnectionError {
    pub alias: String,
    pub attempts: u32,
    #[source]
    pub last: SshError,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Transport error: {0}")]
    Transport(#[from] SshError),

    #[error("No active shell session for {0}. Start one first.")]
    NoActiveShell(String),

    #[error("Shell for {0} closed unexpectedly")]
    ShellClosed(String),

    #[error("Command did not finish within {0:?}")]
    CommandTimedOut(Duration),

    #[error("Invalid prompt pattern: {0}")]
    InvalidPromptPattern(#[from] regex::Error),
}
