//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to
//! it through a [`HandleController`], which sends commands over an mpsc
//! channel. No lock is ever held across an SSH round trip.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, session_id);
//! let channel = controller.open_session_channel().await?;
//! controller.disconnect().await;
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner task checks whether the server side went away
const LIVENESS_POLL: Duration = Duration::from_secs(5);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (exec or PTY shell)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect; `done_tx` fires once the transport is torn down
    Disconnect { done_tx: oneshot::Sender<()> },
}

/// Cloneable handle to the owner task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Wrap an existing command sender. Production code uses
    /// [`spawn_handle_owner_task`].
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect and wait until the owner task has finished teardown
    pub async fn disconnect(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Disconnect { done_tx })
            .await
            .is_ok()
        {
            // Err means the task already exited
            let _ = done_rx.await;
        }
    }

    /// Whether the owner task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task, taking ownership of `handle`
///
/// The task ends on an explicit disconnect, when every controller is dropped,
/// or when the underlying connection closes.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let handle = handle;
        let mut liveness = tokio::time::interval(LIVENESS_POLL);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut done_waiters: Vec<oneshot::Sender<()>> = Vec::new();

        info!("Handle owner task started for session {}", session_id);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                        let result = handle.channel_open_session().await;
                        if reply_tx.send(result).is_err() {
                            warn!("Caller dropped before receiving channel_open_session result");
                        }
                    }
                    Some(HandleCommand::Disconnect { done_tx }) => {
                        info!("Disconnect requested for session {}", session_id);
                        done_waiters.push(done_tx);
                        break;
                    }
                    None => {
                        info!("All controllers dropped for session {}", session_id);
                        break;
                    }
                },
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("SSH connection closed by peer for session {}", session_id);
                        break;
                    }
                }
            }
        }

        drain_pending_commands(&mut cmd_rx, &mut done_waiters);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        for done_tx in done_waiters {
            let _ = done_tx.send(());
        }
        debug!("Handle owner task terminated for session {}", session_id);
    });

    HandleController { cmd_tx }
}

/// Close the queue and answer everything still in it
fn drain_pending_commands(
    cmd_rx: &mut mpsc::Receiver<HandleCommand>,
    done_waiters: &mut Vec<oneshot::Sender<()>>,
) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect { done_tx } => done_waiters.push(done_tx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_controller_reports_disconnected_when_task_gone() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        assert!(controller.is_connected());

        drop(cmd_rx);
        assert!(!controller.is_connected());
        assert!(matches!(
            controller.open_session_channel().await,
            Err(SshError::Disconnected)
        ));
        // Returns immediately rather than hanging
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn test_drain_answers_queued_commands() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .unwrap();
        let (done_tx, done_rx) = oneshot::channel();
        cmd_tx
            .send(HandleCommand::Disconnect { done_tx })
            .await
            .unwrap();

        let mut waiters = Vec::new();
        drain_pending_commands(&mut cmd_rx, &mut waiters);

        assert!(matches!(reply_rx.await, Ok(Err(russh::Error::Disconnect))));
        assert_eq!(waiters.len(), 1);
        assert!(cmd_tx.is_closed());

        for w in waiters {
            w.send(()).unwrap();
        }
        done_rx.await.unwrap();
    }
}
