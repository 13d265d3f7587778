//! Pipeline configuration.
//!
//! Tunables that belong to the storefront rather than the code live here: the
//! description length cap, the auto-apply confidence threshold, the category
//! taxonomy, the review policy rules, and the model backend. Enum-like sets
//! are versioned; version 1 is reserved for the built-in members so a changed
//! set always comes with a version bump.
use crate::model::{
    CommandBackend, HttpBackend, HttpBackendConfig, InvocationConfig, ModelBackend,
    MAX_RETRIES_LIMIT,
};
use crate::schema::DEFAULT_PASSTHROUGH_FIELDS;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Current schema version for the config file.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;
/// Taxonomy version reserved for [`BUILTIN_CATEGORIES`].
pub const BUILTIN_TAXONOMY_VERSION: u32 = 1;
/// Policy set version reserved for [`builtin_policies`].
pub const BUILTIN_POLICY_VERSION: u32 = 1;

pub const CONFIG_ENV: &str = "LISTING_ASSIST_CONFIG";
pub const LM_COMMAND_ENV: &str = "LISTING_ASSIST_LM_COMMAND";

pub const BUILTIN_CATEGORIES: [&str; 12] = [
    "apparel",
    "accessories",
    "jewelry",
    "home_decor",
    "kitchen_dining",
    "art",
    "toys_games",
    "beauty_personal_care",
    "electronics",
    "books_media",
    "craft_supplies",
    "other",
];

/// Response field names owned by the flows; they can never be passthrough.
const FLOW_FIELD_NAMES: [&str; 8] = [
    "text",
    "tone_tags",
    "category",
    "confidence",
    "alternate_categories",
    "decision",
    "rationale",
    "violated_policies",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendConfig>,
    #[serde(default)]
    pub invocation: InvocationConfig,
    #[serde(default)]
    pub description: DescriptionConfig,
    #[serde(default)]
    pub categorization: CategorizationConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    /// Extra response fields accepted and discarded by every flow.
    #[serde(default = "default_passthrough_fields")]
    pub passthrough_fields: Vec<String>,
}

/// Where model calls go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Command { command: String },
    Http(HttpBackendConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DescriptionConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for DescriptionConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategorizationConfig {
    /// Top confidence below this routes the listing to human review.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub taxonomy: Taxonomy,
}

impl Default for CategorizationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            taxonomy: Taxonomy::default(),
        }
    }
}

/// Closed, versioned category set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Taxonomy {
    pub version: u32,
    pub categories: Vec<String>,
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self {
            version: BUILTIN_TAXONOMY_VERSION,
            categories: BUILTIN_CATEGORIES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ReviewConfig {
    #[serde(default)]
    pub policies: PolicySet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    pub id: String,
    pub description: String,
}

/// Closed, versioned set of review policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySet {
    pub version: u32,
    pub rules: Vec<PolicyRule>,
}

impl PolicySet {
    pub fn ids(&self) -> Vec<String> {
        self.rules.iter().map(|rule| rule.id.clone()).collect()
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            version: BUILTIN_POLICY_VERSION,
            rules: builtin_policies(),
        }
    }
}

pub fn builtin_policies() -> Vec<PolicyRule> {
    [
        (
            "prohibited_item",
            "The item is prohibited on the storefront (weapons, drugs, counterfeit or recalled goods, live animals).",
        ),
        (
            "misleading_pricing",
            "Price, discount, or value claims are misleading or contradict the listed price.",
        ),
        (
            "image_description_mismatch",
            "The images do not plausibly show the item the name and description describe.",
        ),
        (
            "unverifiable_claims",
            "The listing makes warranty, certification, health, or origin claims the seller data cannot support.",
        ),
        (
            "offensive_content",
            "The listing contains hateful, harassing, or sexually explicit content.",
        ),
        (
            "contact_circumvention",
            "The listing asks buyers to pay or contact the seller outside the storefront.",
        ),
    ]
    .into_iter()
    .map(|(id, description)| PolicyRule {
        id: id.to_string(),
        description: description.to_string(),
    })
    .collect()
}

fn default_max_chars() -> usize {
    1000
}

fn default_confidence_threshold() -> f64 {
    0.5
}

fn default_passthrough_fields() -> Vec<String> {
    DEFAULT_PASSTHROUGH_FIELDS
        .iter()
        .map(|field| field.to_string())
        .collect()
}

/// Build the config used when no file is present.
pub fn default_config() -> PipelineConfig {
    PipelineConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        backend: None,
        invocation: InvocationConfig::default(),
        description: DescriptionConfig::default(),
        categorization: CategorizationConfig::default(),
        review: ReviewConfig::default(),
        passthrough_fields: default_passthrough_fields(),
    }
}

/// Render a pretty JSON config stub for `init-config`.
pub fn config_stub() -> Result<String> {
    let mut config = default_config();
    config.backend = Some(BackendConfig::Command {
        command: "llm -m gpt-4o-mini".to_string(),
    });
    serde_json::to_string_pretty(&config).context("serialize config stub")
}

pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: PipelineConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config JSON {}", path.display()))?;
    validate_config(&config).with_context(|| format!("validate config {}", path.display()))?;
    Ok(config)
}

/// Persist a config in a stable JSON format.
pub fn write_config(path: &Path, contents: &str, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        ));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("create config dir")?;
    }
    fs::write(path, contents.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Default per-user config location.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("listing-assist").join("config.json"))
}

/// Resolve the config file: explicit flag, then env var, then the user config dir.
///
/// Returns `None` when nothing was requested and the user file does not exist.
pub fn resolve_config_path(flag: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(path));
    }
    user_config_path().filter(|path| path.is_file())
}

/// Load the effective config, falling back to defaults.
pub fn load_effective_config(flag: Option<&Path>) -> Result<PipelineConfig> {
    match resolve_config_path(flag) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            load_config(&path)
        }
        None => Ok(default_config()),
    }
}

/// Pick the backend: `--lm` flag, then the env var, then the config file.
pub fn resolve_backend_config(
    lm_flag: Option<&str>,
    config: &PipelineConfig,
) -> Result<BackendConfig> {
    if let Some(command) = lm_flag {
        return Ok(BackendConfig::Command {
            command: command.to_string(),
        });
    }
    if let Ok(command) = env::var(LM_COMMAND_ENV) {
        if !command.trim().is_empty() {
            return Ok(BackendConfig::Command { command });
        }
    }
    config.backend.clone().ok_or_else(|| {
        anyhow!(
            "no model backend configured; pass --lm, set {LM_COMMAND_ENV}, or add \"backend\" to the config"
        )
    })
}

/// Construct the backend a config names.
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn ModelBackend>> {
    match config {
        BackendConfig::Command { command } => {
            let backend = CommandBackend::from_command(command)?;
            which::which(backend.program())
                .with_context(|| format!("LM command {:?} not found", backend.program()))?;
            Ok(Arc::new(backend))
        }
        BackendConfig::Http(http) => Ok(Arc::new(HttpBackend::from_config(http)?)),
    }
}

/// Validate schema version, bounds, and the closed sets.
pub fn validate_config(config: &PipelineConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {} (expected {})",
            config.schema_version,
            CONFIG_SCHEMA_VERSION
        ));
    }

    let invocation = &config.invocation;
    if invocation.timeout_ms == 0 {
        return Err(anyhow!("invocation.timeout_ms must be greater than 0"));
    }
    if invocation.max_retries > MAX_RETRIES_LIMIT {
        return Err(anyhow!(
            "invocation.max_retries must be at most {MAX_RETRIES_LIMIT} (got {})",
            invocation.max_retries
        ));
    }

    if config.description.max_chars == 0 {
        return Err(anyhow!("description.max_chars must be at least 1"));
    }

    let threshold = config.categorization.confidence_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(anyhow!(
            "categorization.confidence_threshold must be within [0, 1] (got {threshold})"
        ));
    }

    let taxonomy = &config.categorization.taxonomy;
    validate_members("categorization.taxonomy.categories", &taxonomy.categories)?;
    if taxonomy.categories.len() < 2 {
        return Err(anyhow!(
            "categorization.taxonomy.categories needs at least two members so a low-confidence result has an alternate"
        ));
    }
    validate_version(
        "categorization.taxonomy",
        taxonomy.version,
        BUILTIN_TAXONOMY_VERSION,
        taxonomy.categories != Taxonomy::default().categories,
    )?;

    let policies = &config.review.policies;
    let ids = policies.ids();
    validate_members("review.policies.rules[].id", &ids)?;
    if let Some(rule) = policies
        .rules
        .iter()
        .find(|rule| rule.description.trim().is_empty())
    {
        return Err(anyhow!("policy {:?} needs a description", rule.id));
    }
    validate_version(
        "review.policies",
        policies.version,
        BUILTIN_POLICY_VERSION,
        policies.rules != builtin_policies(),
    )?;

    for field in &config.passthrough_fields {
        if FLOW_FIELD_NAMES.contains(&field.as_str()) {
            return Err(anyhow!(
                "passthrough_fields cannot include flow field {field:?}"
            ));
        }
    }

    match &config.backend {
        Some(BackendConfig::Command { command }) => {
            CommandBackend::from_command(command).context("backend.command")?;
        }
        Some(BackendConfig::Http(http)) => {
            if !(http.endpoint.starts_with("https://") || http.endpoint.starts_with("http://")) {
                return Err(anyhow!(
                    "backend.endpoint must be an http(s) URL (got {:?})",
                    http.endpoint
                ));
            }
            if http.model.trim().is_empty() {
                return Err(anyhow!("backend.model must be non-empty"));
            }
        }
        None => {}
    }
    Ok(())
}

fn validate_members(label: &str, members: &[String]) -> Result<()> {
    if members.is_empty() {
        return Err(anyhow!("{label} must list at least one member"));
    }
    let mut seen = BTreeSet::new();
    for member in members {
        let well_formed = !member.is_empty()
            && member
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');
        if !well_formed {
            return Err(anyhow!(
                "{label} members must be lowercase snake_case (got {member:?})"
            ));
        }
        if !seen.insert(member.as_str()) {
            return Err(anyhow!("{label} lists {member:?} more than once"));
        }
    }
    Ok(())
}

fn validate_version(label: &str, version: u32, builtin: u32, changed: bool) -> Result<()> {
    if version == 0 {
        return Err(anyhow!("{label}.version must be at least 1"));
    }
    if version == builtin && changed {
        return Err(anyhow!(
            "{label}.version {builtin} is reserved for the built-in set; bump the version when changing members"
        ));
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
