//! Single bounded repair pass over a decoded JSON value.
//!
//! Repairs only near misses: field-name case/separator drift, enum members
//! written with different case or separators, numbers sent as strings
//! (including `"85%"`), and numbers outside their declared bounds. Unknown
//! fields and missing fields are left for validation to report.
use super::{FieldKind, ObjectSchema};
use serde_json::{Map, Number, Value};

pub(super) fn repair_object(
    value: Value,
    schema: &ObjectSchema,
    prefix: &str,
    repairs: &mut Vec<String>,
) -> Value {
    let Value::Object(map) = value else {
        return value;
    };
    let present: Vec<String> = map.keys().cloned().collect();
    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        // A variant never replaces a field that is also present; validation
        // reports it as a duplicate.
        let canonical = schema
            .fields
            .iter()
            .find(|field| field.name != key && loose_key(field.name) == loose_key(&key))
            .filter(|field| !present.iter().any(|k| k == field.name) && !out.contains_key(field.name));
        let key = match canonical {
            Some(field) => {
                repairs.push(format!(
                    "renamed field {:?} to {:?}",
                    join(prefix, &key),
                    join(prefix, field.name)
                ));
                field.name.to_string()
            }
            None => key,
        };
        let value = match schema.fields.iter().find(|field| field.name == key) {
            Some(field) => repair_value(value, &field.kind, &join(prefix, &key), repairs),
            None => value,
        };
        out.insert(key, value);
    }
    Value::Object(out)
}

fn repair_value(value: Value, kind: &FieldKind, path: &str, repairs: &mut Vec<String>) -> Value {
    match kind {
        FieldKind::Text { .. } => value,
        FieldKind::Number { min, max } => repair_number(value, *min, *max, path, repairs),
        FieldKind::Enum(members) => repair_enum(value, members, path, repairs),
        FieldKind::List(item) => match value {
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(idx, entry)| repair_value(entry, item, &format!("{path}[{idx}]"), repairs))
                    .collect(),
            ),
            other => other,
        },
        FieldKind::Object(inner) => repair_object(value, inner, path, repairs),
    }
}

fn repair_number(value: Value, min: f64, max: f64, path: &str, repairs: &mut Vec<String>) -> Value {
    let number = match &value {
        Value::Number(number) => match number.as_f64() {
            Some(number) => number,
            None => return value,
        },
        Value::String(text) => match parse_numeric(text) {
            Some(number) => {
                repairs.push(format!("parsed {path} from string {text:?}"));
                number
            }
            None => return value,
        },
        _ => return value,
    };
    let clamped = number.clamp(min, max);
    if clamped != number {
        repairs.push(format!("clamped {path} from {number} to {clamped}"));
    }
    match Number::from_f64(clamped) {
        Some(number) => Value::Number(number),
        None => value,
    }
}

fn parse_numeric(text: &str) -> Option<f64> {
    let text = text.trim();
    let (digits, scale) = match text.strip_suffix('%') {
        Some(digits) => (digits.trim(), 100.0),
        None => (text, 1.0),
    };
    let number: f64 = digits.parse().ok()?;
    number.is_finite().then_some(number / scale)
}

fn repair_enum(value: Value, members: &[String], path: &str, repairs: &mut Vec<String>) -> Value {
    let Value::String(text) = &value else {
        return value;
    };
    if members.iter().any(|member| member == text) {
        return value;
    }
    let wanted = loose_enum(text);
    match members.iter().find(|member| loose_enum(member) == wanted) {
        Some(member) => {
            repairs.push(format!("matched {path} {text:?} to {member:?}"));
            Value::String(member.clone())
        }
        None => value,
    }
}

/// Lowercase and collapse whitespace/hyphen/underscore runs to `_`.
fn loose_enum(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_sep = false;
    for ch in text.trim().chars() {
        if ch.is_whitespace() || ch == '-' || ch == '_' {
            pending_sep = !out.is_empty();
            continue;
        }
        if pending_sep {
            out.push('_');
            pending_sep = false;
        }
        out.extend(ch.to_lowercase());
    }
    out
}

/// Lowercase alphanumerics only, so `toneTags`, `Tone Tags`, and `tone_tags` agree.
pub(super) fn loose_key(key: &str) -> String {
    key.chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
