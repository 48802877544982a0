//! Decoding of streamed command output

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::time::Instant;
use tracing::warn;

use super::command::CommandOptions;
use super::error::SessionError;
use crate::ssh::{ExecEvent, ExecStream, OutputStream, SshError};

/// Incremental UTF-8 decoder that carries split code points across chunks
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + bytes` as possible
    ///
    /// An incomplete sequence at the end is held back for the next call;
    /// invalid bytes elsewhere become U+FFFD.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // Safe: from_utf8 vouched for this prefix
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is left, lossily
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Decoded output from one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub text: String,
    pub stream: OutputStream,
}

impl OutputChunk {
    pub fn is_stderr(&self) -> bool {
        self.stream == OutputStream::Stderr
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    /// Remote process id, first when it was asked for
    Pid(u32),
    Chunk(OutputChunk),
    /// Always the last item of a successful stream
    Exit { status: Option<u32> },
}

pub type CommandStream = BoxStream<'static, Result<CommandOutput, SessionError>>;

/// Where the leading PID line of a wrapped command stands
enum PidLine {
    Off,
    Pending(String),
    Done,
}

struct DecodeState {
    inner: ExecStream,
    stdout: Utf8Decoder,
    stderr: Utf8Decoder,
    pid: PidLine,
    deadline: Option<(Instant, Duration)>,
    ready: VecDeque<Result<CommandOutput, SessionError>>,
    finished: bool,
}

impl DecodeState {
    fn decoder(&mut self, stream: OutputStream) -> &mut Utf8Decoder {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }

    fn emit_text(&mut self, stream: OutputStream, text: String) {
        if !text.is_empty() {
            self.ready
                .push_back(Ok(CommandOutput::Chunk(OutputChunk { text, stream })));
        }
    }

    fn emit_stdout(&mut self, text: String) {
        let PidLine::Pending(mut line) = std::mem::replace(&mut self.pid, PidLine::Done) else {
            self.emit_text(OutputStream::Stdout, text);
            return;
        };

        line.push_str(&text);
        let Some(newline) = line.find('\n') else {
            self.pid = PidLine::Pending(line);
            return;
        };

        match line[..newline].trim().parse::<u32>() {
            Ok(pid) => {
                self.ready.push_back(Ok(CommandOutput::Pid(pid)));
                let rest = line[newline + 1..].to_string();
                self.emit_text(OutputStream::Stdout, rest);
            }
            Err(_) => {
                warn!("Expected a PID line, passing output through");
                self.emit_text(OutputStream::Stdout, line);
            }
        }
    }

    fn flush(&mut self) {
        let tail = self.stdout.finish();
        self.emit_stdout(tail);
        if let PidLine::Pending(line) = std::mem::replace(&mut self.pid, PidLine::Done) {
            self.emit_text(OutputStream::Stdout, line);
        }
        let tail = self.stderr.finish();
        self.emit_text(OutputStream::Stderr, tail);
    }

    /// Stop reading and drop the exec stream so the remote side is torn down
    fn end(&mut self, last: Result<CommandOutput, SessionError>) {
        self.flush();
        self.ready.push_back(last);
        self.inner = stream::empty().boxed();
        self.finished = true;
    }

    async fn next_event(&mut self) -> Result<Option<Result<ExecEvent, SshError>>, Duration> {
        match self.deadline {
            Some((at, after)) => tokio::time::timeout_at(at, self.inner.next())
                .await
                .map_err(|_| after),
            None => Ok(self.inner.next().await),
        }
    }
}

/// Turn raw exec events into decoded, stream-tagged text
pub fn decode_exec_stream(inner: ExecStream) -> CommandStream {
    decode_command_stream(inner, &CommandOptions::default())
}

/// [`decode_exec_stream`] honouring `options`
///
/// With `capture_pid` the first stdout line is expected to be the PID printed
/// by the wrapped command; anything else is passed through as output. Past
/// `timeout` the stream yields `CommandTimedOut` and ends.
pub fn decode_command_stream(inner: ExecStream, options: &CommandOptions) -> CommandStream {
    let state = DecodeState {
        inner,
        stdout: Utf8Decoder::new(),
        stderr: Utf8Decoder::new(),
        pid: if options.capture_pid {
            PidLine::Pending(String::new())
        } else {
            PidLine::Off
        },
        deadline: options.timeout.map(|after| (Instant::now() + after, after)),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.next_event().await {
                Ok(Some(Ok(ExecEvent::Output { stream, data }))) => {
                    let text = state.decoder(stream).push(&data);
                    match stream {
                        OutputStream::Stdout => state.emit_stdout(text),
                        OutputStream::Stderr => state.emit_text(stream, text),
                    }
                }
                Ok(Some(Ok(ExecEvent::Exit(status)))) => {
                    state.end(Ok(CommandOutput::Exit { status }));
                }
                Ok(Some(Err(e))) => state.end(Err(SessionError::Transport(e))),
                Ok(None) => state.end(Ok(CommandOutput::Exit { status: None })),
                Err(after) => {
                    warn!("Command timed out after {:?}", after);
                    state.end(Err(SessionError::CommandTimedOut(after)));
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_split_codepoint() {
        let bytes = "héllo".as_bytes();
        let mut decoder = Utf8Decoder::new();
        // 'é' is two bytes; split between them
        assert_eq!(decoder.push(&bytes[..2]), "h");
        assert_eq!(decoder.push(&bytes[2..]), "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(b"a\xffb"), "a\u{FFFD}b");
        assert_eq!(decoder.push(b"\xe2\x82"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[tokio::test]
    async fn test_decode_stream_tags_and_exit() {
        let euro = "€".as_bytes();
        let events: Vec<Result<ExecEvent, SshError>> = vec![
            Ok(ExecEvent::Output {
                stream: OutputStream::Stdout,
                data: vec![b'a', euro[0]],
            }),
            Ok(ExecEvent::Output {
                stream: OutputStream::Stderr,
                data: b"warn".to_vec(),
            }),
            Ok(ExecEvent::Output {
                stream: OutputStream::Stdout,
                data: euro[1..].to_vec(),
            }),
            Ok(ExecEvent::Exit(Some(2))),
        ];

        let items: Vec<_> = decode_exec_stream(stream::iter(events).boxed())
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(
            items,
            vec![
                CommandOutput::Chunk(OutputChunk {
                    text: "a".into(),
                    stream: OutputStream::Stdout
                }),
                CommandOutput::Chunk(OutputChunk {
                    text: "warn".into(),
                    stream: OutputStream::Stderr
                }),
                CommandOutput::Chunk(OutputChunk {
                    text: "€".into(),
                    stream: OutputStream::Stdout
                }),
                CommandOutput::Exit { status: Some(2) },
            ]
        );
    }

    fn stdout(data: &str) -> Result<ExecEvent, SshError> {
        Ok(ExecEvent::Output {
            stream: OutputStream::Stdout,
            data: data.as_bytes().to_vec(),
        })
    }

    #[tokio::test]
    async fn test_pid_line_split_across_chunks() {
        let events = vec![
            stdout("42"),
            stdout("17\nfirst\n"),
            stdout("second\n"),
            Ok(ExecEvent::Exit(Some(0))),
        ];
        let options = CommandOptions::default().with_pid();

        let items: Vec<_> = decode_command_stream(stream::iter(events).boxed(), &options)
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(items[0], CommandOutput::Pid(4217));
        let text: String = items
            .iter()
            .filter_map(|item| match item {
                CommandOutput::Chunk(chunk) => Some(chunk.text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_missing_pid_line_is_passed_through() {
        let events = vec![stdout("not a pid\n"), stdout("tail")];
        let options = CommandOptions::default().with_pid();

        let items: Vec<_> = decode_command_stream(stream::iter(events).boxed(), &options)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert!(!items.iter().any(|item| matches!(item, CommandOutput::Pid(_))));
        assert!(matches!(
            &items[0],
            CommandOutput::Chunk(chunk) if chunk.text == "not a pid\n"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_ends_a_hung_command() {
        let hung = stream::iter(vec![stdout("partial\n")])
            .chain(stream::pending())
            .boxed();
        let options = CommandOptions::default().with_timeout(Duration::from_secs(5));

        let items: Vec<_> = decode_command_stream(hung, &options).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(
            &items[0],
            Ok(CommandOutput::Chunk(chunk)) if chunk.text == "partial\n"
        ));
        assert!(matches!(
            &items[1],
            Err(SessionError::CommandTimedOut(after)) if *after == Duration::from_secs(5)
        ));
    }

    #[tokio::test]
    async fn test_decode_stream_without_exit_event() {
        let events: Vec<Result<ExecEvent, SshError>> = vec![Ok(ExecEvent::Output {
            stream: OutputStream::Stdout,
            data: b"done".to_vec(),
        })];

        let items: Vec<_> = decode_exec_stream(stream::iter(events).boxed())
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(
            items.last(),
            Some(Ok(CommandOutput::Exit { status: None }))
        ));
    }
}
