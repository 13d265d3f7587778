use super::*;

fn write_json(dir: &Path, name: &str, value: &serde_json::Value) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, serde_json::to_vec_pretty(value).expect("serialize")).expect("write config");
    path
}

#[test]
fn default_config_validates() {
    validate_config(&default_config()).expect("defaults are valid");
}

#[test]
fn stub_round_trips_through_loader() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested/config.json");
    write_config(&path, &config_stub().expect("stub"), false).expect("write stub");

    let config = load_config(&path).expect("load stub");
    assert_eq!(config.description.max_chars, 1000);
    assert_eq!(config.categorization.confidence_threshold, 0.5);
    assert!(matches!(config.backend, Some(BackendConfig::Command { .. })));
}

#[test]
fn write_config_refuses_to_clobber_without_force() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.json");
    write_config(&path, "{}", false).expect("first write");
    let err = write_config(&path, "{}", false).expect_err("second write refused");
    assert!(err.to_string().contains("--force"));
    write_config(&path, "{}", true).expect("forced write");
}

#[test]
fn partial_file_fills_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_json(
        dir.path(),
        "config.json",
        &serde_json::json!({
            "schema_version": 1,
            "description": {"max_chars": 280}
        }),
    );
    let config = load_config(&path).expect("load");
    assert_eq!(config.description.max_chars, 280);
    assert_eq!(config.invocation, InvocationConfig::default());
    assert_eq!(config.categorization.taxonomy, Taxonomy::default());
    assert_eq!(config.passthrough_fields, vec!["reasoning", "notes", "schema_version"]);
}

#[test]
fn unknown_keys_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_json(
        dir.path(),
        "config.json",
        &serde_json::json!({"schema_version": 1, "max_char": 10}),
    );
    let err = load_config(&path).expect_err("typo rejected");
    assert!(format!("{err:#}").contains("max_char"));
}

#[test]
fn http_backend_parses_with_kind_tag() {
    let config: PipelineConfig = serde_json::from_value(serde_json::json!({
        "schema_version": 1,
        "backend": {
            "kind": "http",
            "endpoint": "https://api.example.test/v1/chat/completions",
            "model": "small-model",
            "api_key_env": "EXAMPLE_API_KEY"
        }
    }))
    .expect("parse http backend");
    validate_config(&config).expect("valid");
    match config.backend {
        Some(BackendConfig::Http(http)) => {
            assert_eq!(http.model, "small-model");
            assert_eq!(http.api_key_env.as_deref(), Some("EXAMPLE_API_KEY"));
        }
        other => panic!("unexpected backend {other:?}"),
    }
}

#[test]
fn bounds_are_enforced() {
    let mut config = default_config();
    config.invocation.max_retries = 4;
    assert!(validate_config(&config).is_err());

    let mut config = default_config();
    config.invocation.timeout_ms = 0;
    assert!(validate_config(&config).is_err());

    let mut config = default_config();
    config.description.max_chars = 0;
    assert!(validate_config(&config).is_err());

    let mut config = default_config();
    config.categorization.confidence_threshold = 1.5;
    assert!(validate_config(&config).is_err());

    let mut config = default_config();
    config.categorization.confidence_threshold = f64::NAN;
    assert!(validate_config(&config).is_err());
}

#[test]
fn changed_taxonomy_requires_version_bump() {
    let mut config = default_config();
    config.categorization.taxonomy.categories.push("garden".to_string());
    let err = validate_config(&config).expect_err("reserved version");
    assert!(err.to_string().contains("reserved"));

    config.categorization.taxonomy.version = 2;
    validate_config(&config).expect("bumped version accepted");
}

#[test]
fn changed_policies_require_version_bump() {
    let mut config = default_config();
    config.review.policies.rules.truncate(2);
    assert!(validate_config(&config).is_err());
    config.review.policies.version = 7;
    validate_config(&config).expect("bumped version accepted");
}

#[test]
fn duplicate_and_malformed_members_are_rejected() {
    let mut config = default_config();
    config.categorization.taxonomy = Taxonomy {
        version: 2,
        categories: vec!["art".to_string(), "art".to_string()],
    };
    assert!(validate_config(&config).is_err());

    config.categorization.taxonomy.categories = vec!["Home Decor".to_string()];
    assert!(validate_config(&config).is_err());

    config.categorization.taxonomy.categories = Vec::new();
    assert!(validate_config(&config).is_err());
}

#[test]
fn single_member_taxonomy_is_rejected() {
    let mut config = default_config();
    config.categorization.taxonomy = Taxonomy {
        version: 2,
        categories: vec!["art".to_string()],
    };
    let err = validate_config(&config).expect_err("one member");
    assert!(err.to_string().contains("at least two"), "{err}");

    config.categorization.taxonomy.categories.push("other".to_string());
    validate_config(&config).expect("two members accepted");
}

#[test]
fn passthrough_cannot_shadow_flow_fields() {
    let mut config = default_config();
    config.passthrough_fields.push("confidence".to_string());
    assert!(validate_config(&config).is_err());
}

#[test]
fn lm_flag_wins_over_config_backend() {
    let mut config = default_config();
    config.backend = Some(BackendConfig::Command {
        command: "from-config".to_string(),
    });
    let resolved = resolve_backend_config(Some("from-flag --json"), &config).expect("resolve");
    assert_eq!(
        resolved,
        BackendConfig::Command {
            command: "from-flag --json".to_string()
        }
    );
}

#[test]
fn explicit_config_path_is_returned_as_is() {
    let path = Path::new("/tmp/listing-assist/custom.json");
    assert_eq!(resolve_config_path(Some(path)), Some(path.to_path_buf()));
}

#[test]
fn build_backend_rejects_missing_program() {
    let config = BackendConfig::Command {
        command: "listing-assist-no-such-program-xyz".to_string(),
    };
    let err = build_backend(&config).err().expect("missing program");
    assert!(err.to_string().contains("not found"));
}
