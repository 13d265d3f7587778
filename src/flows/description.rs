//! Buyer-facing description generation.
use super::{complete, section, FlowContext, FlowError, FlowResult};
use crate::config::DescriptionConfig;
use crate::product::ProductDraft;
use crate::schema::{render_template, FieldKind, FieldSpec, FlowId, ObjectSchema};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

const TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/description.md"
));

/// Tone tag the flow adds when it shortened the model's text.
pub const TRUNCATED_TAG: &str = "truncated";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedDescription {
    pub text: String,
    pub tone_tags: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
struct DescriptionResponse {
    text: String,
    #[serde(default)]
    tone_tags: Vec<String>,
}

pub struct DescriptionFlow {
    ctx: FlowContext,
    max_chars: usize,
}

impl DescriptionFlow {
    pub fn new(ctx: FlowContext, config: &DescriptionConfig) -> Self {
        Self {
            ctx,
            max_chars: config.max_chars,
        }
    }

    pub fn schema(&self) -> ObjectSchema {
        ObjectSchema::new(
            vec![
                FieldSpec::required("text", FieldKind::Text { min_chars: 1 }),
                FieldSpec::optional(
                    "tone_tags",
                    FieldKind::List(Box::new(FieldKind::Text { min_chars: 1 })),
                ),
            ],
            &self.ctx.passthrough,
        )
    }

    pub fn render_prompt(&self, draft: &ProductDraft) -> String {
        let images = (!draft.images.is_empty()).then(|| {
            format!(
                "The seller attached {} image(s); you cannot see them, so do not describe them.",
                draft.images.len()
            )
        });
        render_template(
            TEMPLATE,
            &[
                ("max_chars", self.max_chars.to_string()),
                ("name", draft.name.trim().to_string()),
                (
                    "category_section",
                    section("Seller Category", draft.category_hint()),
                ),
                (
                    "description_section",
                    section("Seller Description", Some(draft.description_text())),
                ),
                ("images_section", section("Images", images.as_deref())),
            ],
        )
    }

    pub fn run(&self, draft: &ProductDraft) -> Result<FlowResult<GeneratedDescription>, FlowError> {
        let prompt = self.render_prompt(draft);
        let done = complete::<DescriptionResponse>(&self.ctx, FlowId::Description, &self.schema(), &prompt)?;

        let mut warnings = Vec::new();
        let mut tone_tags = normalize_tags(&done.value.tone_tags);
        if tone_tags.remove(TRUNCATED_TAG) {
            tracing::debug!("dropped model-supplied truncated tag");
        }

        let mut text = done.value.text.trim().to_string();
        if let Some(short) = truncate_description(&text, self.max_chars) {
            tracing::warn!(
                original_chars = text.chars().count(),
                max_chars = self.max_chars,
                kept_chars = short.chars().count(),
                "description truncated"
            );
            warnings.push(format!(
                "description truncated from {} to {} characters",
                text.chars().count(),
                short.chars().count()
            ));
            text = short;
            tone_tags.insert(TRUNCATED_TAG.to_string());
        }

        for claim in unverifiable_claims(&text, draft) {
            tracing::warn!(claim = %claim, "description makes a claim absent from seller data");
            warnings.push(format!(
                "description mentions {claim:?}, which the seller data does not support"
            ));
        }

        let value = GeneratedDescription { text, tone_tags };
        Ok(done.finish(value, warnings))
    }
}

fn normalize_tags(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Shorten `text` to at most `max_chars` characters, or `None` if it fits.
///
/// Cuts after the last sentence end within the limit, else at the last word
/// boundary. A single word longer than the limit is cut mid-word.
pub fn truncate_description(text: &str, max_chars: usize) -> Option<String> {
    if text.chars().count() <= max_chars {
        return None;
    }
    let limit = text
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let window = &text[..limit];

    let mut sentence_end = None;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        let end = idx + ch.len_utf8();
        if end > limit {
            break;
        }
        if !matches!(ch, '.' | '!' | '?') {
            continue;
        }
        let mut close = end;
        while let Some(&(next_idx, next)) = chars.peek() {
            if matches!(next, '"' | '\'' | ')' | '”' | '’') && next_idx + next.len_utf8() <= limit {
                close = next_idx + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let followed_by_space = match text[close..].chars().next() {
            Some(next) => next.is_whitespace(),
            None => true,
        };
        if followed_by_space {
            sentence_end = Some(close);
        }
    }
    if let Some(end) = sentence_end {
        return Some(text[..end].trim_end().to_string());
    }

    let next_is_space = text[limit..].chars().next().is_some_and(char::is_whitespace);
    let word_end = if next_is_space {
        Some(limit)
    } else {
        window.rfind(char::is_whitespace)
    };
    match word_end.map(|end| window[..end].trim_end()) {
        Some(kept) if !kept.is_empty() => Some(kept.to_string()),
        _ => Some(window.to_string()),
    }
}

fn claim_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)([$€£]\s?\d[\d,.]*|\b\d[\d,.]*\s?(?:dollars|euros|pounds|usd|eur|gbp)\b|\b(?:lifetime\s+)?(?:warrant(?:y|ies|ied)|guarantee[sd]?|certified|money[- ]back)\b)",
        )
        .expect("claim regex")
    })
}

/// Price and warranty-style phrases in `text` that the draft never mentions.
pub fn unverifiable_claims(text: &str, draft: &ProductDraft) -> Vec<String> {
    let source = format!(
        "{} {} {}",
        draft.name,
        draft.category_hint().unwrap_or_default(),
        draft.description_text()
    )
    .to_lowercase();
    let mut claims: Vec<String> = Vec::new();
    for found in claim_pattern().find_iter(text) {
        let claim = found.as_str().trim().to_lowercase();
        if !source.contains(&claim) && !claims.contains(&claim) {
            claims.push(claim);
        }
    }
    claims
}

#[cfg(test)]
#[path = "description_tests.rs"]
mod tests;
