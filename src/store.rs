//! Persistence of listing assessments.
//!
//! Only the pipeline writes here. Flows never see a store.
use crate::pipeline::ListingAssessment;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::PathBuf;

/// External sink for finished assessments, keyed by product id.
pub trait ListingStore: Send + Sync {
    fn save(&self, assessment: &ListingAssessment) -> Result<()>;
    fn load(&self, product_id: &str) -> Result<Option<ListingAssessment>>;
}

/// One pretty JSON document per product id under a directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn document_path(&self, product_id: &str) -> Result<PathBuf> {
        validate_product_id(product_id)?;
        Ok(self.root.join(format!("{product_id}.json")))
    }
}

impl ListingStore for DirStore {
    fn save(&self, assessment: &ListingAssessment) -> Result<()> {
        let path = self.document_path(&assessment.product_id)?;
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create {}", self.root.display()))?;
        let text =
            serde_json::to_string_pretty(assessment).context("serialize listing assessment")?;
        let tmp_path = self.root.join(format!(".{}.json.tmp", assessment.product_id));
        fs::write(&tmp_path, text.as_bytes())
            .with_context(|| format!("write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path).with_context(|| format!("publish {}", path.display()))?;
        tracing::debug!(path = %path.display(), "saved listing assessment");
        Ok(())
    }

    fn load(&self, product_id: &str) -> Result<Option<ListingAssessment>> {
        let path = self.document_path(product_id)?;
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let assessment = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(assessment))
    }
}

/// Product ids become file names, so keep them to a safe alphabet.
pub fn validate_product_id(product_id: &str) -> Result<()> {
    let safe = !product_id.is_empty()
        && !product_id.starts_with('.')
        && product_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if !safe {
        return Err(anyhow!(
            "product id {product_id:?} must be non-empty ASCII letters, digits, '-', '_' or '.'"
        ));
    }
    Ok(())
}
