//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Whether another connection attempt could plausibly succeed
    ///
    /// Credential and host-key problems are permanent until someone fixes the
    /// configuration, so retrying them only delays the error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SshError::AuthenticationFailed(_)
                | SshError::KeyError(_)
                | SshError::HostKeyRejected(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
