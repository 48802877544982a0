//! Per-command options and the remote command lines built from them

use std::time::Duration;

/// How one exec command is run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    /// Give up after this long; the stream then ends with
    /// [`SessionError::CommandTimedOut`](super::SessionError::CommandTimedOut)
    pub timeout: Option<Duration>,

    /// Report the remote process id as the first item of the stream
    pub capture_pid: bool,
}

impl CommandOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_pid(mut self) -> Self {
        self.capture_pid = true;
        self
    }
}

/// Single-quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Print the shell's PID, then replace the shell with `command`
///
/// `exec` keeps the PID, so the printed number is the process that runs
/// `command` and can be signalled later.
pub(crate) fn with_pid_echo(command: &str) -> String {
    let inner = format!("echo $$; exec sh -c {}", shell_quote(command));
    format!("sh -c {}", shell_quote(&inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("ls -la"), "'ls -la'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_pid_echo_wrapping() {
        assert_eq!(
            with_pid_echo("tail -f /var/log/syslog"),
            r"sh -c 'echo $$; exec sh -c '\''tail -f /var/log/syslog'\'''"
        );
    }

    #[test]
    fn test_builders() {
        let options = CommandOptions::default()
            .with_timeout(Duration::from_secs(5))
            .with_pid();
        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
        assert!(options.capture_pid);
    }
}
