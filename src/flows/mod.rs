//! Description, categorization, and review flows.
//!
//! Each flow renders its prompt, makes one logical model call through
//! [`crate::model::invoke`], parses the response against its own schema, and
//! applies its post-processing rules. Flows hold no mutable state between
//! calls; everything they need is injected through [`FlowContext`].
use crate::model::{
    invoke, CancellationToken, InvocationConfig, InvocationError, ModelBackend,
};
use crate::observe::{FlowInvocationRecord, InvocationObserver, InvocationOutcome};
use crate::schema::{parse_response, prompt_hash, FlowId, ObjectSchema, ValidationError};
use crate::util::now_epoch_ms;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod categorization;
pub mod description;
pub mod review;

pub use categorization::{CategorizationFlow, CategoryCandidate, CategoryClassification};
pub use description::{DescriptionFlow, GeneratedDescription};
pub use review::{Decision, ReviewContext, ReviewFlow, ReviewVerdict};

/// Typed failure of a flow invocation.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum FlowError {
    #[error(transparent)]
    Validation(ValidationError),
    #[error(transparent)]
    Invocation(InvocationError),
}

impl FlowError {
    #[cfg(test)]
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            FlowError::Validation(err) => Some(err),
            FlowError::Invocation(_) => None,
        }
    }

    pub fn as_invocation(&self) -> Option<&InvocationError> {
        match self {
            FlowError::Invocation(err) => Some(err),
            FlowError::Validation(_) => None,
        }
    }
}

/// Successful flow output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowResult<T> {
    pub value: T,
    /// True when the response only validated after the repair pass.
    pub repaired: bool,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub states: Vec<FlowState>,
}

/// Lifecycle of a single flow invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Pending,
    Invoking,
    ParseOk,
    ParseFail,
    Repairing,
    RepairOk,
    RepairFail,
    InvocationFailed,
    Returned,
    Failed,
}

impl FlowState {
    /// Legal successor states. `Invoking` is entered at most once.
    pub fn can_advance_to(self, next: FlowState) -> bool {
        use FlowState::*;
        matches!(
            (self, next),
            (Pending, Invoking)
                | (Invoking, ParseOk)
                | (Invoking, ParseFail)
                | (Invoking, InvocationFailed)
                | (ParseOk, Returned)
                | (ParseFail, Repairing)
                | (Repairing, RepairOk)
                | (Repairing, RepairFail)
                | (RepairOk, Returned)
                | (RepairFail, Failed)
                | (InvocationFailed, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Returned | FlowState::Failed)
    }
}

/// Ordered record of the states one invocation passed through.
#[derive(Debug)]
struct Trail {
    flow: FlowId,
    states: Vec<FlowState>,
}

impl Trail {
    fn new(flow: FlowId) -> Self {
        Self {
            flow,
            states: vec![FlowState::Pending],
        }
    }

    fn advance(&mut self, next: FlowState) {
        let current = self.states.last().copied().unwrap_or(FlowState::Pending);
        debug_assert!(!current.is_terminal(), "flow already finished at {current:?}");
        debug_assert!(
            current.can_advance_to(next),
            "illegal flow transition {current:?} -> {next:?}"
        );
        tracing::debug!(flow = self.flow.as_str(), from = ?current, to = ?next, "flow state");
        self.states.push(next);
    }
}

/// Everything a flow needs from the outside world.
#[derive(Clone)]
pub struct FlowContext {
    pub backend: Arc<dyn ModelBackend>,
    pub observer: Arc<dyn InvocationObserver>,
    pub invocation: InvocationConfig,
    pub passthrough: Vec<String>,
    pub cancel: CancellationToken,
}

impl FlowContext {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        observer: Arc<dyn InvocationObserver>,
        invocation: InvocationConfig,
        passthrough: Vec<String>,
    ) -> Self {
        Self {
            backend,
            observer,
            invocation,
            passthrough,
            cancel: CancellationToken::new(),
        }
    }

    /// Share `cancel` with the caller so it can stop pending retries.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Parsed model output, before flow-specific post-processing.
pub(crate) struct Completed<T> {
    pub value: T,
    pub repaired: bool,
    pub states: Vec<FlowState>,
}

impl<T> Completed<T> {
    pub(crate) fn finish<U>(self, value: U, warnings: Vec<String>) -> FlowResult<U> {
        FlowResult {
            value,
            repaired: self.repaired,
            warnings,
            states: self.states,
        }
    }
}

/// Invoke the model once and parse the response, emitting exactly one record.
pub(crate) fn complete<T: DeserializeOwned>(
    ctx: &FlowContext,
    flow: FlowId,
    schema: &ObjectSchema,
    prompt: &str,
) -> Result<Completed<T>, FlowError> {
    let mut trail = Trail::new(flow);
    let hash = prompt_hash(prompt);
    let record = |latency: Duration, attempts: u32, outcome, error: Option<String>| {
        ctx.observer.record(&FlowInvocationRecord {
            flow,
            prompt_hash: hash.clone(),
            model_latency_ms: latency.as_millis() as u64,
            attempt_count: attempts,
            outcome,
            backend: ctx.backend.name().to_string(),
            timestamp_ms: now_epoch_ms(),
            error,
        });
    };

    trail.advance(FlowState::Invoking);
    let invocation = match invoke(
        ctx.backend.as_ref(),
        flow,
        prompt,
        &ctx.invocation,
        &ctx.cancel,
    ) {
        Ok(invocation) => invocation,
        Err(err) => {
            trail.advance(FlowState::InvocationFailed);
            trail.advance(FlowState::Failed);
            record(
                Duration::from_millis(err.latency_ms),
                err.attempts,
                InvocationOutcome::Failed,
                Some(err.to_string()),
            );
            return Err(FlowError::Invocation(err));
        }
    };

    match parse_response::<T>(flow, schema, &invocation.raw) {
        Ok(parsed) if !parsed.repaired => {
            trail.advance(FlowState::ParseOk);
            trail.advance(FlowState::Returned);
            record(
                invocation.latency,
                invocation.attempts,
                InvocationOutcome::Success,
                None,
            );
            Ok(Completed {
                value: parsed.value,
                repaired: false,
                states: trail.states,
            })
        }
        Ok(parsed) => {
            trail.advance(FlowState::ParseFail);
            trail.advance(FlowState::Repairing);
            trail.advance(FlowState::RepairOk);
            trail.advance(FlowState::Returned);
            for note in &parsed.repairs {
                tracing::debug!(flow = flow.as_str(), repair = %note, "repair applied");
            }
            record(
                invocation.latency,
                invocation.attempts,
                InvocationOutcome::ValidationRepaired,
                None,
            );
            Ok(Completed {
                value: parsed.value,
                repaired: true,
                states: trail.states,
            })
        }
        Err(err) => {
            trail.advance(FlowState::ParseFail);
            trail.advance(FlowState::Repairing);
            trail.advance(FlowState::RepairFail);
            trail.advance(FlowState::Failed);
            tracing::warn!(flow = flow.as_str(), error = %err, "model response rejected");
            record(
                invocation.latency,
                invocation.attempts,
                InvocationOutcome::Failed,
                Some(err.to_string()),
            );
            Err(FlowError::Validation(err))
        }
    }
}

/// Markdown section for an optional prompt value, empty when absent.
pub(crate) fn section(title: &str, body: Option<&str>) -> String {
    match body.map(str::trim).filter(|text| !text.is_empty()) {
        Some(text) => format!("\n## {title}\n\n{text}\n"),
        None => String::new(),
    }
}
