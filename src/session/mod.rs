//! Remote Session
//!
//! One logical connection to one host:
//! - State machine for the session lifecycle
//! - Connect with exponential backoff retry
//! - Streamed one-shot commands, tagged stdout/stderr, with optional
//!   deadline and PID capture
//! - SFTP file transfer
//! - A persistent interactive shell with output framing

mod command;
mod error;
mod output;
mod remote;
mod retry;
mod shell;
mod state;

pub use command::{shell_quote, CommandOptions};
pub use error::{ConnectionError, SessionError};
pub use output::{
    decode_command_stream, decode_exec_stream, CommandOutput, CommandStream, OutputChunk,
    Utf8Decoder,
};
pub use remote::{EvictReason, Session};
pub use retry::{calculate_backoff, RetryConfig};
pub use shell::{ShellConfig, ShellDriver, ShellFraming};
pub use state::SessionState;
