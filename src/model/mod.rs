//! Model invocation with bounded retry.
//!
//! [`invoke`] performs exactly one logical model call. Transient backend
//! failures (timeouts, rate limits, server errors, empty output) are retried
//! with exponential backoff and jitter, up to `max_retries` extra attempts.
//! Everything else fails immediately. Retry state lives on the stack of a
//! single call and is dropped when it returns.
//!
//! Backends are injected through [`ModelBackend`]:
//!
//! - [`CommandBackend`]: any local command that reads a prompt on stdin and
//!   writes the response on stdout (`llm`, `ollama run`, wrapper scripts)
//! - [`HttpBackend`]: an OpenAI-compatible chat completions endpoint
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

mod cancel;
mod command;
mod http;
#[cfg(test)]
mod scripted;

pub use cancel::CancellationToken;
pub use command::CommandBackend;
pub use http::{HttpBackend, HttpBackendConfig};
#[cfg(test)]
pub(crate) use scripted::ScriptedBackend;

use crate::schema::FlowId;

/// Hard cap on configured retries.
pub const MAX_RETRIES_LIMIT: u32 = 3;

/// One attempt's worth of work handed to a backend.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub flow: FlowId,
    pub prompt: &'a str,
    /// Budget for this attempt; backends must give up when it elapses.
    pub timeout: Duration,
}

/// A generative model provider.
pub trait ModelBackend: Send + Sync {
    /// Short label for logs and invocation records.
    fn name(&self) -> &str;

    fn complete(&self, request: &ModelRequest<'_>) -> Result<String, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    Timeout,
    RateLimited,
    ServerError,
    EmptyOutput,
    MalformedRequest,
    Auth,
    ContentPolicy,
    /// The backend could not be started or reached at all (bad command, missing key).
    Unavailable,
    Other,
}

impl BackendErrorKind {
    /// Return true if another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendErrorKind::Timeout
                | BackendErrorKind::RateLimited
                | BackendErrorKind::ServerError
                | BackendErrorKind::EmptyOutput
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendErrorKind::Timeout => "timeout",
            BackendErrorKind::RateLimited => "rate_limited",
            BackendErrorKind::ServerError => "server_error",
            BackendErrorKind::EmptyOutput => "empty_output",
            BackendErrorKind::MalformedRequest => "malformed_request",
            BackendErrorKind::Auth => "auth",
            BackendErrorKind::ContentPolicy => "content_policy",
            BackendErrorKind::Unavailable => "unavailable",
            BackendErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single backend attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Retry and timeout policy for one logical model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvocationConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    500
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl InvocationConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Budget for the summed duration of every attempt of one invocation.
    /// Backoff sleeps are not charged against it.
    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(
            self.timeout_ms
                .saturating_mul(u64::from(self.max_retries) + 1),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationErrorKind {
    ExhaustedRetries,
    NonTransient,
    Timeout,
    Cancelled,
}

impl InvocationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationErrorKind::ExhaustedRetries => "exhausted_retries",
            InvocationErrorKind::NonTransient => "non_transient",
            InvocationErrorKind::Timeout => "timeout",
            InvocationErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InvocationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The model call failed after the retry policy was applied.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("model invocation failed ({kind}) after {attempts} attempt(s): {message}")]
pub struct InvocationError {
    pub kind: InvocationErrorKind,
    pub attempts: u32,
    pub latency_ms: u64,
    pub message: String,
}

/// Raw output of a successful call plus what it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub raw: String,
    pub attempts: u32,
    pub latency: Duration,
}

/// Execute one logical model call under `config`.
///
/// `cancel` is observed before every attempt and while sleeping between
/// attempts; an attempt already in flight always runs to completion or to its
/// own timeout.
pub fn invoke(
    backend: &dyn ModelBackend,
    flow: FlowId,
    prompt: &str,
    config: &InvocationConfig,
    cancel: &CancellationToken,
) -> Result<Invocation, InvocationError> {
    let start = Instant::now();
    let ceiling = config.ceiling();
    let max_retries = config.max_retries.min(MAX_RETRIES_LIMIT);
    let mut rng = rand::thread_rng();
    let mut last_error: Option<BackendError> = None;
    let mut spent = Duration::ZERO;

    let fail = |kind: InvocationErrorKind, attempts: u32, message: String| InvocationError {
        kind,
        attempts,
        latency_ms: start.elapsed().as_millis() as u64,
        message,
    };

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = backoff_delay(config.backoff_base_ms, attempt, &mut rng);
            tracing::warn!(
                flow = flow.as_str(),
                backend = backend.name(),
                attempt,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %last_error.as_ref().map(ToString::to_string).unwrap_or_default(),
                "retrying model call"
            );
            if cancel.wait(delay) {
                return Err(fail(
                    InvocationErrorKind::Cancelled,
                    attempt,
                    "cancelled between attempts".to_string(),
                ));
            }
        }
        if cancel.is_cancelled() {
            return Err(fail(
                InvocationErrorKind::Cancelled,
                attempt,
                "cancelled before attempt".to_string(),
            ));
        }
        let remaining = ceiling.saturating_sub(spent);
        if remaining.is_zero() {
            return Err(fail(
                InvocationErrorKind::Timeout,
                attempt,
                format!(
                    "attempts used the {} ms invocation ceiling before retry {attempt}",
                    ceiling.as_millis()
                ),
            ));
        }

        let request = ModelRequest {
            flow,
            prompt,
            timeout: config.attempt_timeout().min(remaining),
        };
        let attempt_start = Instant::now();
        let outcome = backend.complete(&request);
        spent += attempt_start.elapsed();
        match outcome {
            Ok(raw) => {
                tracing::info!(
                    flow = flow.as_str(),
                    backend = backend.name(),
                    attempt = attempt + 1,
                    elapsed_ms = attempt_start.elapsed().as_millis() as u64,
                    prompt_bytes = prompt.len(),
                    response_bytes = raw.len(),
                    "model invoke complete"
                );
                return Ok(Invocation {
                    raw,
                    attempts: attempt + 1,
                    latency: start.elapsed(),
                });
            }
            Err(err) if !err.kind.is_transient() => {
                tracing::warn!(
                    flow = flow.as_str(),
                    backend = backend.name(),
                    kind = err.kind.as_str(),
                    "model call failed with non-transient error"
                );
                return Err(fail(
                    InvocationErrorKind::NonTransient,
                    attempt + 1,
                    err.to_string(),
                ));
            }
            Err(err) => last_error = Some(err),
        }
    }

    Err(fail(
        InvocationErrorKind::ExhaustedRetries,
        max_retries + 1,
        last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    ))
}

/// Delay before retry `attempt` (1-based): `base * 2^attempt ± uniform(0, base)`.
pub fn backoff_delay<R: Rng>(base_ms: u64, attempt: u32, rng: &mut R) -> Duration {
    let exponential = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = rng.gen_range(0..=base_ms);
    let millis = if rng.gen_bool(0.5) {
        exponential.saturating_add(jitter)
    } else {
        exponential.saturating_sub(jitter)
    };
    Duration::from_millis(millis)
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
