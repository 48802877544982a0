//! Interactive shell driver
//!
//! Finds where one command's output ends inside a continuous PTY byte stream.
//!
//! Two framings are supported:
//!
//! - **Sentinel** (default): at start-up echo is disabled and the prompts are
//!   emptied; every command is followed by a `printf` of a marker unique to
//!   that call, and output is read up to that marker. Output left over from an
//!   earlier command that timed out is dropped up to and including its own
//!   marker.
//! - **Prompt**: output is read until the text after the echoed command ends
//!   with something matching the prompt regex. A prompt that does not match
//!   makes every call time out.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::SessionError;
use super::output::Utf8Decoder;
use crate::ssh::{PtySize, ShellChannel};

const MARKER_PREFIX: &str = "__SHELLFLEET_";
const MARKER_SUFFIX: &str = "__";

/// Disables echo and clears every prompt variable
const SENTINEL_INIT: &str = "stty -echo 2>/dev/null; PS1=''; PS2=''; PROMPT_COMMAND=''";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShellFraming {
    Prompt,
    #[default]
    Sentinel,
}

impl std::str::FromStr for ShellFraming {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prompt" => Ok(Self::Prompt),
            "sentinel" => Ok(Self::Sentinel),
            other => Err(format!("unknown shell framing: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default)]
    pub framing: ShellFraming,

    /// Regex the end of the output must match in prompt framing
    #[serde(default = "default_prompt_pattern")]
    pub prompt_pattern: String,

    /// Wait for the initial prompt or init sentinel
    #[serde(default = "default_prompt_timeout_ms")]
    pub prompt_timeout_ms: u64,

    /// Wait for one command's output
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default)]
    pub pty: PtySize,
}

fn default_prompt_pattern() -> String {
    r"[$#>]\s*$".to_string()
}

fn default_prompt_timeout_ms() -> u64 {
    5_000
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            framing: ShellFraming::default(),
            prompt_pattern: default_prompt_pattern(),
            prompt_timeout_ms: default_prompt_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            pty: PtySize::default(),
        }
    }
}

enum Framing {
    Prompt(Regex),
    Sentinel { any_marker: Regex },
}

enum Read {
    /// Byte range of the frame boundary in the buffer
    Found(usize, usize),
    TimedOut,
}

/// Runs commands over one shell channel
pub struct ShellDriver {
    alias: String,
    channel: Box<dyn ShellChannel>,
    framing: Framing,
    decoder: Utf8Decoder,
    buffer: String,
    command_timeout: Duration,
    /// Whether the terminal still echoes input back (sentinel framing)
    echoes: bool,
}

impl ShellDriver {
    /// Prepare a freshly opened shell and wait until it is ready
    ///
    /// Not seeing the initial prompt or sentinel in time is logged and
    /// otherwise ignored.
    pub async fn start(
        alias: &str,
        channel: Box<dyn ShellChannel>,
        config: &ShellConfig,
    ) -> Result<Self, SessionError> {
        let framing = match config.framing {
            ShellFraming::Prompt => Framing::Prompt(Regex::new(&config.prompt_pattern)?),
            ShellFraming::Sentinel => Framing::Sentinel {
                any_marker: Regex::new(r"__SHELLFLEET_[0-9a-f]{32}__\r?\n?")?,
            },
        };

        let mut driver = Self {
            alias: alias.to_string(),
            channel,
            framing,
            decoder: Utf8Decoder::new(),
            buffer: String::new(),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            echoes: true,
        };

        let deadline = Instant::now() + Duration::from_millis(config.prompt_timeout_ms);
        let ready = if driver.is_sentinel() {
            let token = new_token();
            let marker_line = printf_marker(&token);
            let init = format!("{}\n{}\n", SENTINEL_INIT, marker_line);
            driver.channel.write(init.as_bytes()).await?;

            let ready = driver.read_until_marker(&token, deadline).await?;
            if let Read::Found(start, _) = &ready {
                // The printf line is read after `stty -echo` ran
                driver.echoes = driver.buffer[..*start].contains(&marker_line);
                if driver.echoes {
                    warn!("Shell for {} still echoes input after stty -echo", driver.alias);
                }
            }
            ready
        } else {
            driver.read_until_prompt(0, deadline).await?
        };

        match ready {
            Read::Found(..) => debug!("Shell for {} is ready", driver.alias),
            Read::TimedOut => warn!(
                "Shell for {} gave no ready signal within {}ms, continuing",
                driver.alias, config.prompt_timeout_ms
            ),
        }
        driver.buffer.clear();
        Ok(driver)
    }

    /// Run one command and return its output
    ///
    /// A timeout is not an error: the returned text says what happened so the
    /// caller can show it.
    pub async fn run(&mut self, command: &str) -> Result<String, SessionError> {
        let deadline = Instant::now() + self.command_timeout;

        if self.is_sentinel() {
            self.run_sentinel(command, deadline).await
        } else {
            self.run_prompt(command, deadline).await
        }
    }

    fn is_sentinel(&self) -> bool {
        matches!(self.framing, Framing::Sentinel { .. })
    }

    async fn run_sentinel(&mut self, command: &str, deadline: Instant) -> Result<String, SessionError> {
        let token = new_token();
        let marker_line = printf_marker(&token);
        let payload = format!("{}\n{}\n", command, marker_line);
        self.channel.write(payload.as_bytes()).await?;

        match self.read_until_marker(&token, deadline).await? {
            Read::Found(start, end) => {
                let raw: String = self.buffer[..start].to_string();
                self.buffer.drain(..end);

                // Anything up to an older marker belongs to a command that timed out
                let fresh = match &self.framing {
                    Framing::Sentinel { any_marker } => match any_marker.find_iter(&raw).last() {
                        Some(stale) => {
                            debug!(
                                "Discarding {} bytes of stale shell output for {}",
                                stale.end(),
                                self.alias
                            );
                            &raw[stale.end()..]
                        }
                        None => raw.as_str(),
                    },
                    Framing::Prompt(_) => raw.as_str(),
                };

                let echoed = self.echoes.then_some((command, marker_line.as_str()));
                Ok(clean_output(fresh, echoed))
            }
            Read::TimedOut => Ok(self.timeout_message()),
        }
    }

    async fn run_prompt(&mut self, command: &str, deadline: Instant) -> Result<String, SessionError> {
        self.buffer.clear();
        self.channel.write(format!("{}\n", command).as_bytes()).await?;

        match self.read_until_prompt(1, deadline).await? {
            Read::Found(..) => {
                let text = normalize_newlines(&self.buffer);
                self.buffer.clear();

                let lines: Vec<&str> = text.lines().collect();
                // First line is the echoed command, last is the prompt
                let body = if lines.len() > 2 {
                    lines[1..lines.len() - 1].join("\n")
                } else {
                    String::new()
                };
                Ok(body)
            }
            Read::TimedOut => Ok(self.timeout_message()),
        }
    }

    fn timeout_message(&self) -> String {
        warn!(
            "Shell command on {} timed out after {:?}",
            self.alias, self.command_timeout
        );
        format!(
            "Error: command timed out after {}s waiting for output",
            self.command_timeout.as_secs_f64()
        )
    }

    async fn read_until_marker(&mut self, token: &str, deadline: Instant) -> Result<Read, SessionError> {
        let marker = format!("{}{}{}", MARKER_PREFIX, token, MARKER_SUFFIX);
        self.read_until(deadline, |buf| {
            buf.find(&marker).map(|start| {
                let mut end = start + marker.len();
                let rest = &buf[end..];
                if rest.starts_with("\r\n") {
                    end += 2;
                } else if rest.starts_with('\n') {
                    end += 1;
                }
                (start, end)
            })
        })
        .await
    }

    /// Wait for the prompt regex to match after the first `skip_lines` lines
    async fn read_until_prompt(&mut self, skip_lines: usize, deadline: Instant) -> Result<Read, SessionError> {
        let prompt = match &self.framing {
            Framing::Prompt(regex) => regex.clone(),
            Framing::Sentinel { .. } => return Ok(Read::TimedOut),
        };

        self.read_until(deadline, |buf| {
            let mut offset = 0;
            for _ in 0..skip_lines {
                offset += buf[offset..].find('\n')? + 1;
            }
            prompt
                .find(&buf[offset..])
                .map(|m| (offset + m.start(), offset + m.end()))
        })
        .await
    }

    async fn read_until<F>(&mut self, deadline: Instant, mut boundary: F) -> Result<Read, SessionError>
    where
        F: FnMut(&str) -> Option<(usize, usize)>,
    {
        loop {
            if let Some((start, end)) = boundary(&self.buffer) {
                return Ok(Read::Found(start, end));
            }

            match tokio::time::timeout_at(deadline, self.channel.read()).await {
                Ok(Some(data)) => {
                    let text = self.decoder.push(&data);
                    self.buffer.push_str(&text);
                }
                Ok(None) => return Err(SessionError::ShellClosed(self.alias.clone())),
                Err(_) => return Ok(Read::TimedOut),
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.channel.write(b"exit\n").await;
        self.channel.close().await;
    }
}

fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The marker is assembled by printf so an echoed command line never contains it
fn printf_marker(token: &str) -> String {
    format!(
        "printf '{}%s{}\\n' {}",
        MARKER_PREFIX, MARKER_SUFFIX, token
    )
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "")
}

/// Strip CRs and trailing newlines
///
/// `echoed` is the command and marker line as typed, given only when the
/// terminal echoes input; those lines are dropped from the output then.
fn clean_output(raw: &str, echoed: Option<(&str, &str)>) -> String {
    let text = normalize_newlines(raw);
    let Some((command, marker_line)) = echoed else {
        return text.trim_end_matches('\n').to_string();
    };

    let mut lines: Vec<&str> = text.lines().collect();
    if let (Some(first), Some(typed)) = (lines.first(), command.lines().next()) {
        if *first == typed {
            lines.remove(0);
        }
    }
    lines.retain(|line| *line != marker_line);
    lines.join("\n").trim_end_matches('\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeShell;

    fn sentinel_config() -> ShellConfig {
        ShellConfig {
            command_timeout_ms: 200,
            prompt_timeout_ms: 200,
            ..Default::default()
        }
    }

    fn prompt_config() -> ShellConfig {
        ShellConfig {
            framing: ShellFraming::Prompt,
            ..sentinel_config()
        }
    }

    #[test]
    fn test_printf_marker_hides_literal_marker() {
        let line = printf_marker("abc");
        assert_eq!(line, r"printf '__SHELLFLEET_%s__\n' abc");
        assert!(!line.contains("__SHELLFLEET_abc__"));
    }

    #[test]
    fn test_clean_output() {
        let echoed = Some(("ls", "printf m"));
        assert_eq!(clean_output("ls\r\na\r\nb\r\nprintf m\r\n", echoed), "a\nb");
        assert_eq!(clean_output("a\r\n", echoed), "a");
        assert_eq!(clean_output("", echoed), "");

        // Without echo, output that looks like the command is kept
        assert_eq!(clean_output("ls\r\na\r\n", None), "ls\na");
        assert_eq!(clean_output("", None), "");
    }

    #[tokio::test]
    async fn test_sentinel_run() {
        let mut shell = ShellDriver::start("web", Box::new(FakeShell::new()), &sentinel_config())
            .await
            .unwrap();

        assert_eq!(shell.run("echo hello").await.unwrap(), "hello");
        assert_eq!(shell.run("cd /tmp").await.unwrap(), "");
        assert_eq!(shell.run("pwd").await.unwrap(), "/tmp");
    }

    #[tokio::test]
    async fn test_sentinel_keeps_output_that_repeats_the_command() {
        let mut shell = ShellDriver::start("web", Box::new(FakeShell::new()), &sentinel_config())
            .await
            .unwrap();
        assert!(!shell.echoes);

        shell.run("cd pwd").await.unwrap();
        assert_eq!(shell.run("pwd").await.unwrap(), "pwd");
    }

    #[tokio::test]
    async fn test_sentinel_strips_echo_when_stty_fails() {
        let mut shell = ShellDriver::start(
            "web",
            Box::new(FakeShell::new().with_sticky_echo()),
            &sentinel_config(),
        )
        .await
        .unwrap();
        assert!(shell.echoes);

        assert_eq!(shell.run("echo hello").await.unwrap(), "hello");
        shell.run("cd pwd").await.unwrap();
        assert_eq!(shell.run("pwd").await.unwrap(), "pwd");
    }

    #[tokio::test]
    async fn test_sentinel_discards_stale_output_after_timeout() {
        let mut shell = ShellDriver::start("web", Box::new(FakeShell::new()), &sentinel_config())
            .await
            .unwrap();

        let timed_out = shell.run("slow late-output").await.unwrap();
        assert!(timed_out.starts_with("Error: command timed out"));

        // The late output of the slow command arrives now, ahead of this one's
        assert_eq!(shell.run("echo fresh").await.unwrap(), "fresh");
        assert_eq!(shell.run("echo next").await.unwrap(), "next");
    }

    #[tokio::test]
    async fn test_prompt_run() {
        let mut shell = ShellDriver::start("web", Box::new(FakeShell::new()), &prompt_config())
            .await
            .unwrap();

        assert_eq!(shell.run("pwd").await.unwrap(), "/root");
        assert_eq!(shell.run("echo a b").await.unwrap(), "a b");
    }

    #[tokio::test]
    async fn test_prompt_mismatch_times_out() {
        let config = ShellConfig {
            prompt_pattern: "NEVER>$".to_string(),
            ..prompt_config()
        };
        let mut shell = ShellDriver::start("web", Box::new(FakeShell::new()), &config)
            .await
            .unwrap();

        let out = shell.run("pwd").await.unwrap();
        assert!(out.starts_with("Error: command timed out"));
    }

    #[tokio::test]
    async fn test_invalid_prompt_pattern() {
        let config = ShellConfig {
            prompt_pattern: "([".to_string(),
            ..prompt_config()
        };
        let result = ShellDriver::start("web", Box::new(FakeShell::new()), &config).await;
        assert!(matches!(result, Err(SessionError::InvalidPromptPattern(_))));
    }

    #[tokio::test]
    async fn test_closed_shell_is_an_error() {
        let mut shell = ShellDriver::start("web", Box::new(FakeShell::new()), &sentinel_config())
            .await
            .unwrap();
        assert!(matches!(
            shell.run("exit").await,
            Err(SessionError::ShellClosed(_))
        ));
    }
}
