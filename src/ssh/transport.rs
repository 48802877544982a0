//! Transport seam between sessions and the SSH library
//!
//! Sessions and the pool only talk to these traits. The russh-backed
//! implementations live in `client` and `session`; tests substitute
//! in-process fakes.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use super::config::{PtySize, SshConfig};
use super::error::SshError;

/// Which remote stream a chunk of output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Raw event from a one-shot exec channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Output { stream: OutputStream, data: Vec<u8> },
    /// Remote process finished; `None` if the server sent no status
    Exit(Option<u32>),
}

pub type ExecStream = BoxStream<'static, Result<ExecEvent, SshError>>;

/// An authenticated connection to one host
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `command` on a fresh channel, streaming its output
    ///
    /// Dropping the stream before it reports an exit closes the channel and
    /// asks the remote process to terminate.
    async fn exec(&self, command: &str) -> Result<ExecStream, SshError>;

    /// Copy the remote file at `remote` to `local`; returns the bytes copied
    async fn download(&self, remote: &str, local: &Path) -> Result<u64, SshError>;

    /// Copy `local` to the remote path `remote`; returns the bytes copied
    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, SshError>;

    /// Open a PTY shell channel
    async fn open_shell(&self, pty: PtySize) -> Result<Box<dyn ShellChannel>, SshError>;

    fn is_connected(&self) -> bool;

    /// Tear the connection down and wait until it is gone
    async fn close(&self);
}

/// A long-lived interactive shell channel
#[async_trait]
pub trait ShellChannel: Send + Sync {
    async fn write(&mut self, data: &[u8]) -> Result<(), SshError>;

    /// Next chunk of shell output; `None` once the channel has closed
    async fn read(&mut self) -> Option<Vec<u8>>;

    async fn close(&mut self);
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn Transport>, SshError>;
}
