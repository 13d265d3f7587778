//! Policy review of a listing before publication.
use super::{
    complete, section, CategoryClassification, FlowContext, FlowError, FlowResult,
    GeneratedDescription,
};
use crate::config::PolicySet;
use crate::product::ProductDraft;
use crate::schema::{render_template, FieldKind, FieldSpec, FlowId, ObjectSchema};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

const TEMPLATE: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/review.md"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Flag,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Flag => "flag",
            Decision::Reject => "reject",
        }
    }

    fn members() -> Vec<String> {
        [Decision::Approve, Decision::Flag, Decision::Reject]
            .iter()
            .map(|decision| decision.as_str().to_string())
            .collect()
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewVerdict {
    pub decision: Decision,
    pub rationale: String,
    pub violated_policies: BTreeSet<String>,
    pub policy_version: u32,
}

/// Outputs of the other flows, when they succeeded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReviewContext {
    #[serde(default)]
    pub description: Option<GeneratedDescription>,
    #[serde(default)]
    pub classification: Option<CategoryClassification>,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    decision: Decision,
    rationale: String,
    #[serde(default)]
    violated_policies: Vec<String>,
}

pub struct ReviewFlow {
    ctx: FlowContext,
    policies: PolicySet,
}

impl ReviewFlow {
    pub fn new(ctx: FlowContext, policies: &PolicySet) -> Self {
        Self {
            ctx,
            policies: policies.clone(),
        }
    }

    pub fn schema(&self) -> ObjectSchema {
        ObjectSchema::new(
            vec![
                FieldSpec::required("decision", FieldKind::Enum(Decision::members())),
                FieldSpec::required("rationale", FieldKind::Text { min_chars: 1 }),
                FieldSpec::optional(
                    "violated_policies",
                    FieldKind::List(Box::new(FieldKind::Enum(self.policies.ids()))),
                ),
            ],
            &self.ctx.passthrough,
        )
    }

    pub fn render_prompt(&self, draft: &ProductDraft, context: &ReviewContext) -> String {
        let policies = self
            .policies
            .rules
            .iter()
            .map(|rule| format!("- `{}`: {}", rule.id, rule.description))
            .collect::<Vec<_>>()
            .join("\n");
        let images = (!draft.images.is_empty()).then(|| {
            draft
                .images
                .iter()
                .map(|uri| format!("- {uri}"))
                .collect::<Vec<_>>()
                .join("\n")
        });
        let generated = context.description.as_ref().map(|description| {
            let tags = description
                .tone_tags
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}\n\nTone: {tags}", description.text)
        });
        let classification = context.classification.as_ref().map(|class| {
            format!(
                "Category: `{}` (confidence {:.2}, taxonomy version {})",
                class.category, class.confidence, class.taxonomy_version
            )
        });
        render_template(
            TEMPLATE,
            &[
                ("policy_version", self.policies.version.to_string()),
                ("policies", policies),
                ("name", draft.name.trim().to_string()),
                ("price_minor_units", draft.price_minor_units.to_string()),
                ("seller_id", draft.seller_id.clone()),
                (
                    "category_section",
                    section("Seller Category", draft.category_hint()),
                ),
                (
                    "description_section",
                    section("Seller Description", Some(draft.description_text())),
                ),
                ("images_section", section("Images", images.as_deref())),
                (
                    "generated_section",
                    section("Generated Description", generated.as_deref()),
                ),
                (
                    "classification_section",
                    section("Assigned Category", classification.as_deref()),
                ),
            ],
        )
    }

    pub fn run(
        &self,
        draft: &ProductDraft,
        context: &ReviewContext,
    ) -> Result<FlowResult<ReviewVerdict>, FlowError> {
        let prompt = self.render_prompt(draft, context);
        let done = complete::<ReviewResponse>(&self.ctx, FlowId::Review, &self.schema(), &prompt)?;
        let response = &done.value;
        let mut warnings = Vec::new();

        let violated: BTreeSet<String> = response.violated_policies.iter().cloned().collect();
        let decision = match response.decision {
            Decision::Reject if violated.is_empty() => {
                tracing::warn!("reject without violated policies; downgrading to flag");
                warnings.push(
                    "model rejected without naming a violated policy; downgraded to flag"
                        .to_string(),
                );
                Decision::Flag
            }
            Decision::Approve if !violated.is_empty() => {
                tracing::warn!(
                    policies = violated.len(),
                    "approve with violated policies; downgrading to flag"
                );
                warnings.push(format!(
                    "model approved while naming violated policies ({}); downgraded to flag",
                    violated.iter().cloned().collect::<Vec<_>>().join(", ")
                ));
                Decision::Flag
            }
            decision => decision,
        };

        let value = ReviewVerdict {
            decision,
            rationale: response.rationale.trim().to_string(),
            violated_policies: violated,
            policy_version: self.policies.version,
        };
        Ok(done.finish(value, warnings))
    }
}
