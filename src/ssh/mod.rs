//! SSH module - connections, channels and host key verification
//!
//! Built on the russh client library.
//!
//! # Features
//! - Password and public-key authentication, tried in order
//! - Host key verification via `~/.ssh/known_hosts` with a configurable policy
//! - Single-owner handle task (see `handle_owner`)
//! - One-shot exec channels streaming stdout/stderr
//! - PTY shell channels
//!
//! Everything above this module goes through the [`Connector`] /
//! [`Transport`] / [`ShellChannel`] traits.

mod client;
mod config;
mod error;
mod handle_owner;
pub mod known_hosts;
mod session;
pub mod transport;

pub use client::{ClientHandler, RusshConnector, SshClient};
pub use config::{AuthMethod, HostKeyPolicy, PtySize, SshConfig, SshTuning};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use session::{RemoteShell, SshSession, SshTransport};
pub use transport::{Connector, ExecEvent, ExecStream, OutputStream, ShellChannel, Transport};
