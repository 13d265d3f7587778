//! Local LM command backend.
//!
//! Invokes a user-configured command with the prompt on stdin and reads the
//! response from stdout. Rather than embedding provider SDKs, this delegates
//! to whatever the operator wraps (`llm`, `ollama run`, a caching script), so
//! provider auth and model choice stay outside the pipeline.
//!
//! The child sees `LISTING_ASSIST_FLOW` in its environment, which lets
//! wrapper scripts and test mocks switch on the flow being served.
//!
//! Failure classification:
//!
//! - exit code 75 (`EX_TEMPFAIL`) or death by signal: transient server error
//! - stderr mentioning rate limits, timeouts, 5xx, or network trouble: transient
//! - stderr mentioning auth or content policy: non-transient
//! - any other non-zero exit: non-transient
use super::{BackendError, BackendErrorKind, ModelBackend, ModelRequest};
use crate::util::preview;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

/// Environment variable naming the flow a command invocation serves.
pub const FLOW_ENV: &str = "LISTING_ASSIST_FLOW";

const EX_TEMPFAIL: i32 = 75;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Minimum wait for buffered output once the command has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct CommandBackend {
    argv: Vec<String>,
    label: String,
}

impl CommandBackend {
    /// Parse a shell-words command line such as `llm -m gpt-4o-mini`.
    pub fn from_command(command: &str) -> Result<Self> {
        let argv =
            shell_words::split(command).with_context(|| format!("parse LM command: {command}"))?;
        if argv.is_empty() {
            return Err(anyhow!("LM command is empty"));
        }
        let label = format!("command:{}", argv[0]);
        Ok(Self { argv, label })
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    fn spawn(&self, request: &ModelRequest<'_>) -> Result<Child, BackendError> {
        Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .env(FLOW_ENV, request.flow.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                BackendError::new(
                    BackendErrorKind::Unavailable,
                    format!("spawn LM command {}: {err}", self.argv[0]),
                )
            })
    }
}

impl ModelBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.label
    }

    fn complete(&self, request: &ModelRequest<'_>) -> Result<String, BackendError> {
        let start = Instant::now();
        let mut child = self.spawn(request)?;

        // Pipes are drained on their own threads so a chatty child cannot
        // block on a full pipe while we poll for exit.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.to_string();
            thread::spawn(move || {
                // The child may exit without reading stdin; that surfaces via its status.
                let _ = stdin.write_all(prompt.as_bytes());
            });
        }
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if start.elapsed() >= request.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BackendError::new(
                        BackendErrorKind::Timeout,
                        format!(
                            "LM command exceeded {} ms and was killed",
                            request.timeout.as_millis()
                        ),
                    ));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => {
                    return Err(BackendError::new(
                        BackendErrorKind::Other,
                        format!("wait for LM command: {err}"),
                    ))
                }
            }
        };

        // A background process the command left behind may still hold the
        // pipes open, so reading them is bounded by the attempt budget too.
        let drain_until = Instant::now()
            + request
                .timeout
                .saturating_sub(start.elapsed())
                .max(DRAIN_GRACE);
        let stderr = collect(stderr, drain_until).unwrap_or_default();
        let Some(stdout) = collect(stdout, drain_until) else {
            return Err(BackendError::new(
                BackendErrorKind::Timeout,
                format!(
                    "LM command exited but its output stayed open past {} ms",
                    request.timeout.as_millis()
                ),
            ));
        };

        if !status.success() {
            let kind = classify_failure(status.code(), &stderr);
            return Err(BackendError::new(
                kind,
                format!(
                    "LM command failed with status {status}: {}",
                    preview(stderr.trim(), 400)
                ),
            ));
        }
        if stdout.trim().is_empty() {
            return Err(BackendError::new(
                BackendErrorKind::EmptyOutput,
                "LM command produced no output",
            ));
        }
        Ok(stdout)
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// Output of a drained pipe, or `None` if it did not reach EOF by `until`.
fn collect(pipe: Option<Receiver<Vec<u8>>>, until: Instant) -> Option<String> {
    let Some(pipe) = pipe else {
        return Some(String::new());
    };
    pipe.recv_timeout(until.saturating_duration_since(Instant::now()))
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn stderr_patterns() -> &'static [(BackendErrorKind, Regex)] {
    static PATTERNS: OnceLock<Vec<(BackendErrorKind, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                BackendErrorKind::ContentPolicy,
                r"(?i)content[ _-]?(policy|filter)|safety system|moderation",
            ),
            (
                BackendErrorKind::Auth,
                r"(?i)unauthori[sz]ed|forbidden|invalid api key|authentication|\b40[13]\b",
            ),
            (
                BackendErrorKind::RateLimited,
                r"(?i)rate[ _-]?limit|too many requests|quota exceeded|\b429\b",
            ),
            (BackendErrorKind::Timeout, r"(?i)timed? ?out|deadline exceeded"),
            (
                BackendErrorKind::ServerError,
                r"(?i)\b5\d\d\b|server error|overloaded|service unavailable|connection (refused|reset)|network",
            ),
            (
                BackendErrorKind::MalformedRequest,
                r"(?i)bad request|invalid request|\b400\b",
            ),
        ]
        .into_iter()
        .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("stderr pattern")))
        .collect()
    })
}

/// Classify a failed command from its exit code and stderr.
fn classify_failure(code: Option<i32>, stderr: &str) -> BackendErrorKind {
    if let Some(kind) = stderr_patterns()
        .iter()
        .find(|(_, pattern)| pattern.is_match(stderr))
        .map(|(kind, _)| *kind)
    {
        return kind;
    }
    match code {
        Some(EX_TEMPFAIL) | None => BackendErrorKind::ServerError,
        Some(_) => BackendErrorKind::Other,
    }
}
