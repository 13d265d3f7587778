//! Structured contracts around model output.
//!
//! Every flow declares an [`ObjectSchema`] for the JSON object it expects back
//! from the model. Responses go through a strict parse first; when that fails,
//! one bounded repair pass runs (payload extraction, key/enum normalization,
//! numeric coercion and clamping) before the response is validated again.
//! Anything still wrong is reported as a [`ValidationError`] that names the
//! failing field paths and keeps the raw output for inspection.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

mod extract;
mod repair;

pub use extract::{extract_payload, strip_trailing_commas};

use crate::util::{preview, sha256_hex};

/// Response fields accepted and discarded when the config does not override them.
pub const DEFAULT_PASSTHROUGH_FIELDS: [&str; 3] = ["reasoning", "notes", "schema_version"];

/// Identifies a flow in prompts, records, logs, and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowId {
    Description,
    Categorization,
    Review,
}

impl FlowId {
    /// Return the stable string identifier used in JSON artifacts.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowId::Description => "description",
            FlowId::Categorization => "categorization",
            FlowId::Review => "review",
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected shape of a single response field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// String with at least `min_chars` non-whitespace-trimmed characters.
    Text { min_chars: usize },
    /// Finite number within the inclusive bounds.
    Number { min: f64, max: f64 },
    /// One of a closed set of string members.
    Enum(Vec<String>),
    List(Box<FieldKind>),
    Object(ObjectSchema),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Closed object shape: declared fields plus a passthrough allowlist.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSchema {
    pub fields: Vec<FieldSpec>,
    pub passthrough: Vec<String>,
}

impl ObjectSchema {
    pub fn new(fields: Vec<FieldSpec>, passthrough: &[String]) -> Self {
        Self {
            fields,
            passthrough: passthrough.to_vec(),
        }
    }

    fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    fn allows_passthrough(&self, name: &str) -> bool {
        self.passthrough.iter().any(|allowed| allowed == name)
    }
}

/// A single field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// JSON path of the field (`alternate_categories[1].confidence`, `$` for the root).
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Model output that could not be parsed or repaired into the flow schema.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{flow} response failed validation: {}", summarize(.fields))]
pub struct ValidationError {
    pub flow: FlowId,
    pub raw_output: String,
    pub fields: Vec<FieldError>,
}

#[cfg(test)]
impl ValidationError {
    /// True when one of the failures is reported at `path`.
    pub fn names_field(&self, path: &str) -> bool {
        self.fields.iter().any(|field| field.path == path)
    }
}

fn summarize(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Successfully parsed response plus what the repair pass had to change.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub value: T,
    pub repaired: bool,
    pub repairs: Vec<String>,
}

/// Parse a raw model response into `T`, repairing near misses once.
pub fn parse_response<T: DeserializeOwned>(
    flow: FlowId,
    schema: &ObjectSchema,
    raw: &str,
) -> Result<Parsed<T>, ValidationError> {
    let strict = serde_json::from_str::<Value>(raw.trim())
        .map_err(|err| vec![FieldError::new("$", format!("invalid JSON: {err}"))])
        .and_then(|value| decode::<T>(schema, value));
    let strict_errors = match strict {
        Ok(value) => {
            return Ok(Parsed {
                value,
                repaired: false,
                repairs: Vec::new(),
            })
        }
        Err(errors) => errors,
    };

    tracing::debug!(
        flow = flow.as_str(),
        errors = %summarize(&strict_errors),
        "strict parse failed; attempting repair"
    );

    let fail = |fields: Vec<FieldError>| ValidationError {
        flow,
        raw_output: raw.to_string(),
        fields,
    };

    let Some(payload) = extract_payload(raw) else {
        return Err(fail(vec![FieldError::new("$", "no JSON object found in response")]));
    };
    let mut repairs = Vec::new();
    if payload != raw.trim() {
        repairs.push("extracted JSON payload from surrounding text".to_string());
    }
    let cleaned = strip_trailing_commas(payload);
    if cleaned != payload {
        repairs.push("removed trailing commas".to_string());
    }
    let value: Value = serde_json::from_str(&cleaned).map_err(|err| {
        fail(vec![FieldError::new(
            "$",
            format!("invalid JSON after extraction: {err}"),
        )])
    })?;
    let value = repair::repair_object(value, schema, "", &mut repairs);
    let decoded = decode::<T>(schema, value).map_err(fail)?;

    tracing::warn!(
        flow = flow.as_str(),
        repairs = repairs.len(),
        raw_preview = %preview(raw, 200),
        "model response repaired"
    );
    Ok(Parsed {
        value: decoded,
        repaired: true,
        repairs,
    })
}

/// Validate against the schema, drop passthrough fields, and deserialize.
fn decode<T: DeserializeOwned>(schema: &ObjectSchema, value: Value) -> Result<T, Vec<FieldError>> {
    let mut errors = Vec::new();
    let Value::Object(map) = value else {
        return Err(vec![FieldError::new(
            "$",
            format!("expected a JSON object, got {}", type_name(&value)),
        )]);
    };
    check_object(schema, &map, "", &mut errors);
    if !errors.is_empty() {
        return Err(errors);
    }
    let declared = retain_declared(schema, map);
    serde_json::from_value(Value::Object(declared))
        .map_err(|err| vec![FieldError::new("$", format!("decode failed: {err}"))])
}

fn retain_declared(schema: &ObjectSchema, map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .filter_map(|(key, value)| {
            let field = schema.field(&key)?;
            let value = match (&field.kind, value) {
                (FieldKind::Object(inner), Value::Object(obj)) => {
                    Value::Object(retain_declared(inner, obj))
                }
                (FieldKind::List(item), Value::Array(items)) => match item.as_ref() {
                    FieldKind::Object(inner) => Value::Array(
                        items
                            .into_iter()
                            .map(|entry| match entry {
                                Value::Object(obj) => Value::Object(retain_declared(inner, obj)),
                                other => other,
                            })
                            .collect(),
                    ),
                    _ => Value::Array(items),
                },
                (_, value) => value,
            };
            Some((key, value))
        })
        .collect()
}

fn check_object(
    schema: &ObjectSchema,
    map: &Map<String, Value>,
    prefix: &str,
    errors: &mut Vec<FieldError>,
) {
    for field in &schema.fields {
        let path = join_path(prefix, field.name);
        match map.get(field.name) {
            None | Some(Value::Null) if field.required => {
                errors.push(FieldError::new(path, "missing required field"));
            }
            None | Some(Value::Null) => {}
            Some(value) => check_value(&field.kind, value, &path, errors),
        }
    }
    for key in map.keys() {
        if schema.field(key).is_some() || schema.allows_passthrough(key) {
            continue;
        }
        let duplicated = schema.fields.iter().find(|field| {
            map.contains_key(field.name) && repair::loose_key(field.name) == repair::loose_key(key)
        });
        let message = match duplicated {
            Some(field) => format!("duplicates field {:?}", field.name),
            None => "unexpected field".to_string(),
        };
        errors.push(FieldError::new(join_path(prefix, key), message));
    }
}

fn check_value(kind: &FieldKind, value: &Value, path: &str, errors: &mut Vec<FieldError>) {
    match kind {
        FieldKind::Text { min_chars } => match value.as_str() {
            Some(text) if text.trim().chars().count() >= *min_chars => {}
            Some(_) => errors.push(FieldError::new(
                path,
                format!("must contain at least {min_chars} non-blank character(s)"),
            )),
            None => errors.push(type_error(path, "string", value)),
        },
        FieldKind::Number { min, max } => match value.as_f64() {
            Some(number) if number >= *min && number <= *max => {}
            Some(number) => errors.push(FieldError::new(
                path,
                format!("{number} is outside [{min}, {max}]"),
            )),
            None => errors.push(type_error(path, "number", value)),
        },
        FieldKind::Enum(members) => match value.as_str() {
            Some(text) if members.iter().any(|member| member == text) => {}
            Some(text) => errors.push(FieldError::new(
                path,
                format!("{text:?} is not one of [{}]", members.join(", ")),
            )),
            None => errors.push(type_error(path, "string", value)),
        },
        FieldKind::List(item) => match value.as_array() {
            Some(items) => {
                for (idx, entry) in items.iter().enumerate() {
                    check_value(item, entry, &format!("{path}[{idx}]"), errors);
                }
            }
            None => errors.push(type_error(path, "array", value)),
        },
        FieldKind::Object(inner) => match value.as_object() {
            Some(map) => check_object(inner, map, path, errors),
            None => errors.push(type_error(path, "object", value)),
        },
    }
}

fn type_error(path: &str, expected: &str, value: &Value) -> FieldError {
    FieldError::new(
        path,
        format!("expected {expected}, got {}", type_name(value)),
    )
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Fill `{placeholder}` tokens in a single pass.
///
/// Substituted values are never rescanned, so braces inside seller text stay
/// literal. Placeholders without a value render as empty strings.
pub fn render_template(template: &str, values: &[(&str, String)]) -> String {
    static PLACEHOLDER: OnceLock<regex::Regex> = OnceLock::new();
    let placeholder = PLACEHOLDER
        .get_or_init(|| regex::Regex::new(r"\{([a-z_]+)\}").expect("placeholder regex"));
    placeholder
        .replace_all(template, |caps: &regex::Captures| {
            values
                .iter()
                .find(|(key, _)| *key == &caps[1])
                .map(|(_, value)| value.clone())
                .unwrap_or_default()
        })
        .into_owned()
}

/// Stable identifier for a rendered prompt.
pub fn prompt_hash(prompt: &str) -> String {
    sha256_hex(prompt.as_bytes())
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
