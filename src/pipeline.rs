//! Sequences the flows for one product.
//!
//! Description and categorization have no dependency on each other and run on
//! scoped threads; review waits for both and gets whatever succeeded. The
//! pipeline never invents output for a failed flow: a listing with any failed
//! flow stays `pending_ai_assist`.
use crate::config::PipelineConfig;
use crate::flows::{
    CategorizationFlow, CategoryClassification, Decision, DescriptionFlow, FlowContext,
    FlowError, FlowResult, GeneratedDescription, ReviewContext, ReviewFlow, ReviewVerdict,
};
use crate::model::{CancellationToken, ModelBackend};
use crate::observe::{Fanout, FlowInvocationRecord, InvocationObserver, MemoryObserver};
use crate::product::ProductDraft;
use crate::schema::FlowId;
use crate::store::{validate_product_id, ListingStore};
use crate::util::now_epoch_ms;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    /// At least one flow failed; retry later.
    PendingAiAssist,
    Rejected,
    NeedsHumanReview,
    Ready,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::PendingAiAssist => "pending_ai_assist",
            ListingStatus::Rejected => "rejected",
            ListingStatus::NeedsHumanReview => "needs_human_review",
            ListingStatus::Ready => "ready",
        }
    }
}

/// Why a flow produced no output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowFailure {
    pub flow: FlowId,
    /// `validation`, or the invocation error kind.
    pub kind: String,
    pub message: String,
}

impl FlowFailure {
    fn new(flow: FlowId, err: &FlowError) -> Self {
        let kind = err
            .as_invocation()
            .map_or("validation", |invocation| invocation.kind.as_str());
        Self {
            flow,
            kind: kind.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingAssessment {
    pub product_id: String,
    pub status: ListingStatus,
    pub description: Option<GeneratedDescription>,
    pub classification: Option<CategoryClassification>,
    pub verdict: Option<ReviewVerdict>,
    pub warnings: Vec<String>,
    pub failures: Vec<FlowFailure>,
    pub records: Vec<FlowInvocationRecord>,
    pub assessed_at_ms: u64,
}

pub struct Pipeline {
    backend: Arc<dyn ModelBackend>,
    observer: Arc<dyn InvocationObserver>,
    config: PipelineConfig,
    deadline: Option<Duration>,
    store: Option<Arc<dyn ListingStore>>,
}

impl Pipeline {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        observer: Arc<dyn InvocationObserver>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            backend,
            observer,
            config,
            deadline: None,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ListingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Cancel pending retries once an assessment has run this long.
    ///
    /// An attempt already in flight still finishes or hits its own timeout.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn context(
        &self,
        observer: Arc<dyn InvocationObserver>,
        cancel: &CancellationToken,
    ) -> FlowContext {
        FlowContext::new(
            self.backend.clone(),
            observer,
            self.config.invocation.clone(),
            self.config.passthrough_fields.clone(),
        )
        .with_cancel(cancel.clone())
    }

    /// Run every flow for `draft` and derive the listing status.
    pub fn assess(&self, product_id: &str, draft: &ProductDraft) -> Result<ListingAssessment> {
        self.assess_with_cancel(product_id, draft, &CancellationToken::new())
    }

    /// [`Pipeline::assess`] with a caller-owned token. Firing it, or reaching
    /// the deadline, stops pending retries of this assessment only.
    pub fn assess_with_cancel(
        &self,
        product_id: &str,
        draft: &ProductDraft,
        cancel: &CancellationToken,
    ) -> Result<ListingAssessment> {
        validate_product_id(product_id)?;
        draft.validate().context("product draft")?;

        let memory = Arc::new(MemoryObserver::default());
        let observer: Arc<dyn InvocationObserver> = Arc::new(
            Fanout::new()
                .with(self.observer.clone())
                .with(memory.clone()),
        );
        let ctx = self.context(observer, cancel);
        let description_flow = DescriptionFlow::new(ctx.clone(), &self.config.description);
        let categorization_flow = CategorizationFlow::new(ctx.clone(), &self.config.categorization);
        let review_flow = ReviewFlow::new(ctx, &self.config.review.policies);

        let mut warnings = Vec::new();
        let mut failures = Vec::new();
        let finished = CancellationToken::new();
        let (description, classification, verdict) = thread::scope(|scope| {
            if let Some(deadline) = self.deadline {
                let finished = finished.clone();
                let cancel = cancel.clone();
                scope.spawn(move || {
                    if !finished.wait(deadline) {
                        tracing::warn!(
                            deadline_ms = deadline.as_millis() as u64,
                            "assessment deadline reached; cancelling pending retries"
                        );
                        cancel.cancel();
                    }
                });
            }

            let describe = scope.spawn(|| description_flow.run(draft));
            let categorize = scope.spawn(|| categorization_flow.run(draft));
            let joined = describe
                .join()
                .map_err(|_| anyhow!("description flow panicked"))
                .and_then(|description| {
                    let classification = categorize
                        .join()
                        .map_err(|_| anyhow!("categorization flow panicked"))?;
                    Ok((description, classification))
                });
            let (description, classification) = match joined {
                Ok(joined) => joined,
                Err(err) => {
                    finished.cancel();
                    return Err(err);
                }
            };

            let description =
                settle(FlowId::Description, description, &mut warnings, &mut failures);
            let classification = settle(
                FlowId::Categorization,
                classification,
                &mut warnings,
                &mut failures,
            );
            let context = ReviewContext {
                description: description.clone(),
                classification: classification.clone(),
            };
            let verdict = settle(
                FlowId::Review,
                review_flow.run(draft, &context),
                &mut warnings,
                &mut failures,
            );
            finished.cancel();
            Ok::<_, anyhow::Error>((description, classification, verdict))
        })?;

        let status = derive_status(
            &failures,
            classification.as_ref(),
            verdict.as_ref(),
            self.config.categorization.confidence_threshold,
        );
        let mut records = memory.records();
        records.sort_by_key(|record| record.flow);

        tracing::info!(
            product_id,
            status = status.as_str(),
            failures = failures.len(),
            warnings = warnings.len(),
            "listing assessed"
        );

        let assessment = ListingAssessment {
            product_id: product_id.to_string(),
            status,
            description,
            classification,
            verdict,
            warnings,
            failures,
            records,
            assessed_at_ms: now_epoch_ms(),
        };
        if let Some(store) = &self.store {
            store.save(&assessment).context("save listing assessment")?;
        }
        Ok(assessment)
    }
}

fn settle<T>(
    flow: FlowId,
    result: Result<FlowResult<T>, FlowError>,
    warnings: &mut Vec<String>,
    failures: &mut Vec<FlowFailure>,
) -> Option<T> {
    match result {
        Ok(result) => {
            warnings.extend(
                result
                    .warnings
                    .into_iter()
                    .map(|warning| format!("{flow}: {warning}")),
            );
            Some(result.value)
        }
        Err(err) => {
            tracing::warn!(flow = flow.as_str(), error = %err, "flow failed");
            failures.push(FlowFailure::new(flow, &err));
            None
        }
    }
}

/// Status from flow outcomes, most severe first.
pub fn derive_status(
    failures: &[FlowFailure],
    classification: Option<&CategoryClassification>,
    verdict: Option<&ReviewVerdict>,
    threshold: f64,
) -> ListingStatus {
    let (Some(classification), Some(verdict)) = (classification, verdict) else {
        return ListingStatus::PendingAiAssist;
    };
    if !failures.is_empty() {
        return ListingStatus::PendingAiAssist;
    }
    match verdict.decision {
        Decision::Reject => ListingStatus::Rejected,
        Decision::Flag => ListingStatus::NeedsHumanReview,
        Decision::Approve if !classification.is_confident(threshold) => {
            ListingStatus::NeedsHumanReview
        }
        Decision::Approve => ListingStatus::Ready,
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
