//! SSH Session: exec and PTY shell channels over an authenticated handle

use std::path::Path;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Sig};
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::config::PtySize;
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::transport::{ExecEvent, ExecStream, OutputStream, ShellChannel, Transport};

/// An authenticated handle that has not yet been handed to its owner task
pub struct SshSession {
    handle: Handle<ClientHandler>,
    target: String,
}

impl SshSession {
    pub fn new(handle: Handle<ClientHandler>, target: String) -> Self {
        Self { handle, target }
    }

    /// Spawn the Handle Owner Task and return the running transport
    pub fn start(self) -> SshTransport {
        let session_id = uuid::Uuid::new_v4().to_string();
        info!("Starting handle owner task {} for {}", session_id, self.target);
        SshTransport {
            controller: spawn_handle_owner_task(self.handle, session_id),
            target: self.target,
        }
    }
}

/// Live russh connection, driven through its owner task
pub struct SshTransport {
    controller: HandleController,
    target: String,
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command: &str) -> Result<ExecStream, SshError> {
        let channel = self.controller.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("exec request failed: {}", e)))?;

        debug!("Exec channel opened on {}", self.target);
        Ok(exec_stream(channel))
    }

    async fn open_shell(&self, pty: PtySize) -> Result<Box<dyn ShellChannel>, SshError> {
        let channel = self.controller.open_session_channel().await?;

        channel
            .request_pty(false, "xterm-256color", pty.cols, pty.rows, 0, 0, &[])
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        info!("Interactive shell started on {}", self.target);
        Ok(Box::new(RemoteShell { channel }))
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64, SshError> {
        let sftp = self.open_sftp().await?;
        let mut remote_file = sftp
            .open(remote)
            .await
            .map_err(|e| SshError::Sftp(format!("cannot open {}: {}", remote, e)))?;
        let mut local_file = tokio::fs::File::create(local).await?;

        let copied = tokio::io::copy(&mut remote_file, &mut local_file).await?;
        local_file.flush().await?;

        info!("Downloaded {} ({} bytes) from {}", remote, copied, self.target);
        Ok(copied)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, SshError> {
        let sftp = self.open_sftp().await?;
        let mut local_file = tokio::fs::File::open(local).await?;
        let mut remote_file = sftp
            .create(remote)
            .await
            .map_err(|e| SshError::Sftp(format!("cannot create {}: {}", remote, e)))?;

        let copied = tokio::io::copy(&mut local_file, &mut remote_file).await?;
        remote_file
            .shutdown()
            .await
            .map_err(|e| SshError::Sftp(format!("closing {} failed: {}", remote, e)))?;

        info!("Uploaded {} ({} bytes) to {}", remote, copied, self.target);
        Ok(copied)
    }

    fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    async fn close(&self) {
        self.controller.disconnect().await;
    }
}

impl SshTransport {
    async fn open_sftp(&self) -> Result<SftpSession, SshError> {
        let channel = self.controller.open_session_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::Sftp(format!("subsystem request failed: {}", e)))?;

        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))
    }
}

/// Teardown for a channel whose reader went away early
trait Abandon: Send + 'static {
    fn abandon(self);
}

impl Abandon for Channel<Msg> {
    fn abandon(self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Exec channel dropped outside a runtime, left to the transport");
            return;
        };
        runtime.spawn(async move {
            let _ = self.signal(Sig::TERM).await;
            let _ = self.eof().await;
            let _ = self.close().await;
            debug!("Abandoned exec channel closed");
        });
    }
}

/// An exec channel that has not reported an exit yet
///
/// Dropping it abandons the channel; [`OpenExec::finish`] is the normal end.
struct OpenExec<C: Abandon> {
    channel: Option<C>,
}

impl<C: Abandon> OpenExec<C> {
    fn new(channel: C) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    fn channel_mut(&mut self) -> Option<&mut C> {
        self.channel.as_mut()
    }

    fn finish(mut self) {
        self.channel = None;
    }
}

impl<C: Abandon> Drop for OpenExec<C> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            debug!("Exec stream dropped before the command exited, closing its channel");
            channel.abandon();
        }
    }
}

/// Relay channel messages until the exit status or channel close
fn exec_stream(channel: Channel<Msg>) -> ExecStream {
    stream::unfold(Some(OpenExec::new(channel)), |state| async move {
        let mut open = state?;
        loop {
            let msg = open.channel_mut()?.wait().await;
            let event = match msg {
                Some(ChannelMsg::Data { data }) => ExecEvent::Output {
                    stream: OutputStream::Stdout,
                    data: data.to_vec(),
                },
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => ExecEvent::Output {
                    stream: OutputStream::Stderr,
                    data: data.to_vec(),
                },
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    open.finish();
                    return Some((Ok(ExecEvent::Exit(Some(exit_status))), None));
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    debug!("Remote process killed by signal {:?}", signal_name);
                    open.finish();
                    return Some((Ok(ExecEvent::Exit(None)), None));
                }
                Some(ChannelMsg::Close) | None => {
                    open.finish();
                    return Some((Ok(ExecEvent::Exit(None)), None));
                }
                Some(_) => continue,
            };
            return Some((Ok(event), Some(open)));
        }
    })
    .boxed()
}

/// PTY shell channel
pub struct RemoteShell {
    channel: Channel<Msg>,
}

#[async_trait]
impl ShellChannel for RemoteShell {
    async fn write(&mut self, data: &[u8]) -> Result<(), SshError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| SshError::ChannelError(format!("shell write failed: {}", e)))
    }

    async fn read(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(data.to_vec()),
                ChannelMsg::ExtendedData { data, .. } => return Some(data.to_vec()),
                ChannelMsg::Eof | ChannelMsg::Close => return None,
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
    }
}
