//! Seller-submitted product drafts.
//!
//! A draft is the only input the flows accept. It mirrors the document the
//! storefront stores (camelCase keys) and is never mutated once handed to a
//! flow.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Raw product data as entered in the seller form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProductDraft {
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub raw_description: String,
    #[serde(default)]
    pub images: Vec<String>,
    pub price_minor_units: u64,
    pub seller_id: String,
}

impl ProductDraft {
    /// Reject drafts that must never reach a model.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("product name must be non-empty"));
        }
        if self.seller_id.trim().is_empty() {
            return Err(anyhow!("sellerId must be non-empty"));
        }
        for (idx, image) in self.images.iter().enumerate() {
            if !is_absolute_uri(image) {
                return Err(anyhow!(
                    "images[{idx}] must be an absolute URI (got {image:?})"
                ));
            }
        }
        Ok(())
    }

    /// Seller-supplied category hint, if it carries any text.
    pub fn category_hint(&self) -> Option<&str> {
        self.category
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Seller description with surrounding whitespace removed.
    pub fn description_text(&self) -> &str {
        self.raw_description.trim()
    }
}

fn is_absolute_uri(value: &str) -> bool {
    let Some((scheme, rest)) = value.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    let starts_alpha = chars.next().is_some_and(|ch| ch.is_ascii_alphabetic());
    starts_alpha
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
        && !rest.is_empty()
}

/// Load and validate a draft from a JSON file.
pub fn load_draft(path: &Path) -> Result<ProductDraft> {
    let bytes = fs::read(path).with_context(|| format!("read product {}", path.display()))?;
    let draft: ProductDraft = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse product JSON {}", path.display()))?;
    draft
        .validate()
        .with_context(|| format!("validate product {}", path.display()))?;
    Ok(draft)
}

#[cfg(test)]
pub(crate) fn mug_draft() -> ProductDraft {
    ProductDraft {
        name: "Hand-Thrown Clay Mug".to_string(),
        category: None,
        raw_description: String::new(),
        images: Vec::new(),
        price_minor_units: 2800,
        seller_id: "seller-17".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_parses_storefront_document() {
        let value = serde_json::json!({
            "name": "Linen Apron",
            "category": "apparel",
            "rawDescription": "Stonewashed linen, adjustable strap.",
            "images": ["https://cdn.example.com/apron.jpg"],
            "priceMinorUnits": 4200,
            "sellerId": "seller-3"
        });
        let draft: ProductDraft = serde_json::from_value(value).expect("parse draft");
        assert_eq!(draft.category_hint(), Some("apparel"));
        assert_eq!(draft.price_minor_units, 4200);
        draft.validate().expect("valid draft");
    }

    #[test]
    fn draft_rejects_negative_price() {
        let value = serde_json::json!({
            "name": "Linen Apron",
            "priceMinorUnits": -1,
            "sellerId": "seller-3"
        });
        assert!(serde_json::from_value::<ProductDraft>(value).is_err());
    }

    #[test]
    fn validate_rejects_relative_image_paths() {
        let mut draft = mug_draft();
        draft.images = vec!["uploads/mug.jpg".to_string()];
        let err = draft.validate().expect_err("relative image");
        assert!(err.to_string().contains("images[0]"));
    }

    #[test]
    fn empty_description_is_valid() {
        let draft = mug_draft();
        draft.validate().expect("empty description allowed");
        assert_eq!(draft.description_text(), "");
        assert_eq!(draft.category_hint(), None);
    }
}
