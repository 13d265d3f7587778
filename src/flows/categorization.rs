//! Taxonomy classification with a confidence gate.
//!
//! The model proposes a category and alternates. The flow does not trust the
//! model's ordering: candidates are merged and re-ranked by confidence, and the
//! highest one becomes the category. Below the configured threshold the
//! classification still succeeds but keeps its alternates so a human can pick.
use super::{complete, section, FlowContext, FlowError, FlowResult};
use crate::config::{CategorizationConfig, Taxonomy};
use crate::product::ProductDraft;
use crate::schema::{render_template, FieldKind, FieldSpec, FlowId, ObjectSchema};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/categorization.md"
));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCandidate {
    pub category: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryClassification {
    pub category: String,
    pub confidence: f64,
    /// Sorted by confidence, highest first. Empty when the top choice is confident.
    pub alternate_categories: Vec<CategoryCandidate>,
    pub taxonomy_version: u32,
}

impl CategoryClassification {
    pub fn is_confident(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }
}

#[derive(Debug, Deserialize)]
struct CategorizationResponse {
    category: String,
    confidence: f64,
    #[serde(default)]
    alternate_categories: Vec<CategoryCandidate>,
}

pub struct CategorizationFlow {
    ctx: FlowContext,
    threshold: f64,
    taxonomy: Taxonomy,
}

impl CategorizationFlow {
    pub fn new(ctx: FlowContext, config: &CategorizationConfig) -> Self {
        Self {
            ctx,
            threshold: config.confidence_threshold,
            taxonomy: config.taxonomy.clone(),
        }
    }

    pub fn schema(&self) -> ObjectSchema {
        let category = FieldKind::Enum(self.taxonomy.categories.clone());
        let confidence = FieldKind::Number { min: 0.0, max: 1.0 };
        let candidate = ObjectSchema::new(
            vec![
                FieldSpec::required("category", category.clone()),
                FieldSpec::required("confidence", confidence.clone()),
            ],
            &self.ctx.passthrough,
        );
        ObjectSchema::new(
            vec![
                FieldSpec::required("category", category),
                FieldSpec::required("confidence", confidence),
                FieldSpec::optional(
                    "alternate_categories",
                    FieldKind::List(Box::new(FieldKind::Object(candidate))),
                ),
            ],
            &self.ctx.passthrough,
        )
    }

    pub fn render_prompt(&self, draft: &ProductDraft) -> String {
        let taxonomy = self
            .taxonomy
            .categories
            .iter()
            .map(|category| format!("- `{category}`"))
            .collect::<Vec<_>>()
            .join("\n");
        render_template(
            TEMPLATE,
            &[
                ("taxonomy_version", self.taxonomy.version.to_string()),
                ("taxonomy", taxonomy),
                ("name", draft.name.trim().to_string()),
                (
                    "category_section",
                    section("Seller Category (may be free text)", draft.category_hint()),
                ),
                (
                    "description_section",
                    section("Seller Description", Some(draft.description_text())),
                ),
            ],
        )
    }

    pub fn run(
        &self,
        draft: &ProductDraft,
    ) -> Result<FlowResult<CategoryClassification>, FlowError> {
        let prompt = self.render_prompt(draft);
        let done = complete::<CategorizationResponse>(
            &self.ctx,
            FlowId::Categorization,
            &self.schema(),
            &prompt,
        )?;
        let response = &done.value;
        let mut warnings = Vec::new();

        let stated = CategoryCandidate {
            category: response.category.clone(),
            confidence: response.confidence,
        };
        let mut ranked = rank_candidates(
            std::iter::once(stated.clone()).chain(response.alternate_categories.iter().cloned()),
        );
        let top = ranked.remove(0);
        if top.category != stated.category {
            tracing::warn!(
                stated = %stated.category,
                stated_confidence = stated.confidence,
                chosen = %top.category,
                chosen_confidence = top.confidence,
                "re-ranked model categories by confidence"
            );
            warnings.push(format!(
                "model named {:?} ({}) but {:?} scored higher ({})",
                stated.category, stated.confidence, top.category, top.confidence
            ));
        }

        let alternates = if top.confidence >= self.threshold {
            Vec::new()
        } else {
            if ranked.is_empty() {
                if let Some(fallback) = self
                    .taxonomy
                    .categories
                    .iter()
                    .find(|category| **category != top.category)
                {
                    ranked.push(CategoryCandidate {
                        category: fallback.clone(),
                        confidence: 0.0,
                    });
                }
            }
            tracing::info!(
                category = %top.category,
                confidence = top.confidence,
                threshold = self.threshold,
                "classification below threshold; keeping alternates"
            );
            ranked
        };

        let value = CategoryClassification {
            category: top.category,
            confidence: top.confidence,
            alternate_categories: alternates,
            taxonomy_version: self.taxonomy.version,
        };
        Ok(done.finish(value, warnings))
    }
}

/// Merge duplicate categories (keeping the highest confidence) and sort
/// descending. The sort is stable, so stated order breaks ties.
pub fn rank_candidates(
    candidates: impl IntoIterator<Item = CategoryCandidate>,
) -> Vec<CategoryCandidate> {
    let mut merged: Vec<CategoryCandidate> = Vec::new();
    for candidate in candidates {
        match merged
            .iter_mut()
            .find(|existing| existing.category == candidate.category)
        {
            Some(existing) => existing.confidence = existing.confidence.max(candidate.confidence),
            None => merged.push(candidate),
        }
    }
    merged.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    merged
}
