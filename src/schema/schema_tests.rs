use super::*;
use serde::Deserialize;

#[derive(Debug, Deserialize, PartialEq)]
struct Verdict {
    decision: String,
    rationale: String,
    #[serde(default)]
    tags: Vec<String>,
}

fn verdict_schema() -> ObjectSchema {
    let passthrough: Vec<String> = DEFAULT_PASSTHROUGH_FIELDS
        .iter()
        .map(|field| field.to_string())
        .collect();
    ObjectSchema::new(
        vec![
            FieldSpec::required(
                "decision",
                FieldKind::Enum(vec!["approve".into(), "flag".into(), "reject".into()]),
            ),
            FieldSpec::required("rationale", FieldKind::Text { min_chars: 1 }),
            FieldSpec::optional(
                "tags",
                FieldKind::List(Box::new(FieldKind::Text { min_chars: 1 })),
            ),
        ],
        &passthrough,
    )
}

#[test]
fn strict_parse_accepts_exact_payload() {
    let raw = r#"{"decision": "approve", "rationale": "Clean listing."}"#;
    let parsed: Parsed<Verdict> =
        parse_response(FlowId::Review, &verdict_schema(), raw).expect("strict parse");
    assert!(!parsed.repaired);
    assert_eq!(parsed.value.decision, "approve");
    assert!(parsed.value.tags.is_empty());
}

#[test]
fn repair_recovers_payload_wrapped_in_prose() {
    let raw = "Here is my assessment:\n```json\n{\"decision\": \"Flag\", \"rationale\": \"Blurry photos.\",}\n```\nLet me know!";
    let parsed: Parsed<Verdict> =
        parse_response(FlowId::Review, &verdict_schema(), raw).expect("repaired parse");
    assert!(parsed.repaired);
    assert_eq!(parsed.value.decision, "flag");
    assert_eq!(parsed.value.rationale, "Blurry photos.");
    assert!(parsed
        .repairs
        .iter()
        .any(|note| note.contains("surrounding text")));
}

#[test]
fn missing_required_field_is_named() {
    let raw = r#"{"decision": "approve"}"#;
    let err = parse_response::<Verdict>(FlowId::Review, &verdict_schema(), raw)
        .expect_err("missing rationale");
    assert!(err.names_field("rationale"));
    assert_eq!(err.raw_output, raw);
    assert_eq!(err.flow, FlowId::Review);
}

#[test]
fn unknown_fields_are_rejected_but_passthrough_is_dropped() {
    let raw = r#"{"decision": "approve", "rationale": "ok", "reasoning": "long chain"}"#;
    let parsed: Parsed<Verdict> =
        parse_response(FlowId::Review, &verdict_schema(), raw).expect("passthrough allowed");
    assert!(!parsed.repaired);

    let raw = r#"{"decision": "approve", "rationale": "ok", "price": 10}"#;
    let err = parse_response::<Verdict>(FlowId::Review, &verdict_schema(), raw)
        .expect_err("extra field");
    assert!(err.names_field("price"));
}

#[test]
fn unknown_enum_member_fails_after_repair() {
    let raw = r#"{"decision": "escalate", "rationale": "unsure"}"#;
    let err = parse_response::<Verdict>(FlowId::Review, &verdict_schema(), raw)
        .expect_err("closed enum");
    assert!(err.names_field("decision"));
    assert!(err.to_string().contains("review response failed validation"));
}

#[test]
fn nested_list_paths_are_reported() {
    let raw = r#"{"decision": "approve", "rationale": "ok", "tags": ["warm", 3]}"#;
    let err = parse_response::<Verdict>(FlowId::Review, &verdict_schema(), raw)
        .expect_err("non-string tag");
    assert!(err.names_field("tags[1]"));
}

#[test]
fn response_without_json_fails_at_root() {
    let err = parse_response::<Verdict>(FlowId::Review, &verdict_schema(), "No.")
        .expect_err("no payload");
    assert!(err.names_field("$"));
}

#[test]
fn render_template_is_single_pass() {
    let rendered = render_template(
        "Name: {name}\nNotes: {notes}\nMissing: {absent}.",
        &[
            ("name", "Mug {notes}".to_string()),
            ("notes", "glazed".to_string()),
        ],
    );
    assert_eq!(rendered, "Name: Mug {notes}\nNotes: glazed\nMissing: .");
}

#[test]
fn render_template_ignores_json_braces() {
    let rendered = render_template(r#"Reply as {"text": "..."} for {name}"#, &[("name", "x".into())]);
    assert_eq!(rendered, r#"Reply as {"text": "..."} for x"#);
}

#[test]
fn case_variant_of_a_present_field_is_a_duplicate() {
    let raw = r#"{"Decision": "reject", "decision": "approve", "rationale": "ok"}"#;
    let err = parse_response::<Verdict>(FlowId::Review, &verdict_schema(), raw)
        .expect_err("duplicate key");
    let field = err
        .fields
        .iter()
        .find(|field| field.path == "Decision")
        .expect("variant reported");
    assert!(field.message.contains("duplicates"), "{}", field.message);
}
