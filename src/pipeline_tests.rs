use super::*;
use crate::config::default_config;
use crate::model::{BackendError, BackendErrorKind, ModelRequest};
use crate::observe::InvocationOutcome;
use crate::product::mug_draft;
use crate::store::DirStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const DESCRIPTION: &str =
    r#"{"text": "A hand-thrown clay mug with a generous handle.", "tone_tags": ["warm"]}"#;
const CONFIDENT: &str = r#"{"category": "kitchen_dining", "confidence": 0.93}"#;
const APPROVE: &str = r#"{"decision": "approve", "rationale": "No issues.", "violated_policies": []}"#;

/// Answers by flow, since description and categorization run concurrently.
struct RoutedBackend {
    replies: HashMap<FlowId, Result<String, BackendError>>,
    prompts: Mutex<HashMap<FlowId, String>>,
}

impl RoutedBackend {
    fn new(replies: [(FlowId, Result<&str, BackendErrorKind>); 3]) -> Self {
        Self {
            replies: replies
                .into_iter()
                .map(|(flow, reply)| {
                    let reply = reply
                        .map(str::to_string)
                        .map_err(|kind| BackendError::new(kind, "routed failure"));
                    (flow, reply)
                })
                .collect(),
            prompts: Mutex::new(HashMap::new()),
        }
    }

    fn prompt(&self, flow: FlowId) -> String {
        self.prompts
            .lock()
            .expect("prompts lock")
            .get(&flow)
            .cloned()
            .unwrap_or_default()
    }
}

impl ModelBackend for RoutedBackend {
    fn name(&self) -> &str {
        "routed"
    }

    fn complete(&self, request: &ModelRequest<'_>) -> Result<String, BackendError> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .insert(request.flow, request.prompt.to_string());
        self.replies
            .get(&request.flow)
            .cloned()
            .unwrap_or_else(|| Err(BackendError::new(BackendErrorKind::Other, "no reply")))
    }
}

fn pipeline(backend: Arc<RoutedBackend>) -> Pipeline {
    let mut config = default_config();
    config.invocation.backoff_base_ms = 0;
    Pipeline::new(backend, Arc::new(MemoryObserver::default()), config)
}

#[test]
fn happy_path_is_ready() {
    let backend = Arc::new(RoutedBackend::new([
        (FlowId::Description, Ok(DESCRIPTION)),
        (FlowId::Categorization, Ok(CONFIDENT)),
        (FlowId::Review, Ok(APPROVE)),
    ]));
    let assessment = pipeline(backend.clone())
        .assess("mug-17", &mug_draft())
        .expect("assess");

    assert_eq!(assessment.status, ListingStatus::Ready);
    assert!(assessment.failures.is_empty());
    assert_eq!(
        assessment.classification.as_ref().map(|c| c.category.as_str()),
        Some("kitchen_dining")
    );
    let flows: Vec<_> = assessment.records.iter().map(|r| r.flow).collect();
    assert_eq!(
        flows,
        vec![FlowId::Description, FlowId::Categorization, FlowId::Review]
    );
    assert!(assessment
        .records
        .iter()
        .all(|r| r.outcome == InvocationOutcome::Success));

    let review_prompt = backend.prompt(FlowId::Review);
    assert!(review_prompt.contains("## Generated Description"));
    assert!(review_prompt.contains("`kitchen_dining`"));
}

#[test]
fn failed_description_leaves_listing_pending_and_review_sees_partial_context() {
    let backend = Arc::new(RoutedBackend::new([
        (FlowId::Description, Err(BackendErrorKind::Auth)),
        (FlowId::Categorization, Ok(CONFIDENT)),
        (FlowId::Review, Ok(APPROVE)),
    ]));
    let assessment = pipeline(backend.clone())
        .assess("mug-17", &mug_draft())
        .expect("assess");

    assert_eq!(assessment.status, ListingStatus::PendingAiAssist);
    assert!(assessment.description.is_none());
    assert!(assessment.verdict.is_some());
    assert_eq!(assessment.failures.len(), 1);
    assert_eq!(assessment.failures[0].flow, FlowId::Description);
    assert_eq!(assessment.failures[0].kind, "non_transient");
    assert_eq!(assessment.records.len(), 3);

    let review_prompt = backend.prompt(FlowId::Review);
    assert!(!review_prompt.contains("## Generated Description"));
    assert!(review_prompt.contains("## Assigned Category"));
}

#[test]
fn downgraded_reject_needs_human_review() {
    let backend = Arc::new(RoutedBackend::new([
        (FlowId::Description, Ok(DESCRIPTION)),
        (FlowId::Categorization, Ok(CONFIDENT)),
        (
            FlowId::Review,
            Ok(r#"{"decision": "reject", "rationale": "Unsure.", "violated_policies": []}"#),
        ),
    ]));
    let assessment = pipeline(backend).assess("mug-17", &mug_draft()).expect("assess");
    assert_eq!(assessment.status, ListingStatus::NeedsHumanReview);
    assert!(assessment.warnings.iter().any(|w| w.starts_with("review: ")));
}

#[test]
fn low_confidence_needs_human_review() {
    let backend = Arc::new(RoutedBackend::new([
        (FlowId::Description, Ok(DESCRIPTION)),
        (
            FlowId::Categorization,
            Ok(r#"{"category": "home_decor", "confidence": 0.3}"#),
        ),
        (FlowId::Review, Ok(APPROVE)),
    ]));
    let assessment = pipeline(backend).assess("mug-17", &mug_draft()).expect("assess");
    assert_eq!(assessment.status, ListingStatus::NeedsHumanReview);
    let classification = assessment.classification.expect("classification");
    assert!(!classification.alternate_categories.is_empty());
}

#[test]
fn policy_reject_is_rejected_and_stored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(DirStore::new(dir.path()));
    let backend = Arc::new(RoutedBackend::new([
        (FlowId::Description, Ok(DESCRIPTION)),
        (FlowId::Categorization, Ok(CONFIDENT)),
        (
            FlowId::Review,
            Ok(r#"{"decision": "reject", "rationale": "Replica goods.", "violated_policies": ["prohibited_item"]}"#),
        ),
    ]));
    let assessment = pipeline(backend)
        .with_store(store.clone())
        .assess("mug-17", &mug_draft())
        .expect("assess");
    assert_eq!(assessment.status, ListingStatus::Rejected);

    let stored = store.load("mug-17").expect("load").expect("stored");
    assert_eq!(stored.status, ListingStatus::Rejected);
    assert_eq!(stored.verdict, assessment.verdict);
    assert_eq!(stored.records, assessment.records);
}

#[test]
fn invalid_draft_never_reaches_the_model() {
    let backend = Arc::new(RoutedBackend::new([
        (FlowId::Description, Ok(DESCRIPTION)),
        (FlowId::Categorization, Ok(CONFIDENT)),
        (FlowId::Review, Ok(APPROVE)),
    ]));
    let mut draft = mug_draft();
    draft.name = "  ".to_string();
    assert!(pipeline(backend.clone()).assess("mug-17", &draft).is_err());
    assert!(backend.prompt(FlowId::Description).is_empty());
}

#[test]
fn cancelled_pipeline_reports_every_flow_failed() {
    let backend = Arc::new(RoutedBackend::new([
        (FlowId::Description, Ok(DESCRIPTION)),
        (FlowId::Categorization, Ok(CONFIDENT)),
        (FlowId::Review, Ok(APPROVE)),
    ]));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let assessment = pipeline(backend)
        .assess_with_cancel("mug-17", &mug_draft(), &cancel)
        .expect("assess");
    assert_eq!(assessment.status, ListingStatus::PendingAiAssist);
    assert_eq!(assessment.failures.len(), 3);
    assert!(assessment.failures.iter().all(|f| f.kind == "cancelled"));
}

#[test]
fn deadline_cancels_pending_retries() {
    let backend = Arc::new(RoutedBackend::new([
        (FlowId::Description, Err(BackendErrorKind::ServerError)),
        (FlowId::Categorization, Err(BackendErrorKind::ServerError)),
        (FlowId::Review, Err(BackendErrorKind::ServerError)),
    ]));
    let mut config = default_config();
    config.invocation.timeout_ms = 60_000;
    config.invocation.backoff_base_ms = 5_000;
    let pipeline = Pipeline::new(backend, Arc::new(MemoryObserver::default()), config)
        .with_deadline(std::time::Duration::from_millis(50));

    let start = std::time::Instant::now();
    let assessment = pipeline.assess("mug-17", &mug_draft()).expect("assess");
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
    assert_eq!(assessment.status, ListingStatus::PendingAiAssist);
    assert_eq!(assessment.failures.len(), 3);
    assert!(
        assessment.failures.iter().all(|f| f.kind == "cancelled"),
        "{:?}",
        assessment.failures
    );
}

/// Fails every flow until `recover` is called.
struct RecoveringBackend {
    broken: RoutedBackend,
    healthy: RoutedBackend,
    recovered: AtomicBool,
}

impl RecoveringBackend {
    fn recover(&self) {
        self.recovered.store(true, Ordering::SeqCst);
    }
}

impl ModelBackend for RecoveringBackend {
    fn name(&self) -> &str {
        "recovering"
    }

    fn complete(&self, request: &ModelRequest<'_>) -> Result<String, BackendError> {
        if self.recovered.load(Ordering::SeqCst) {
            self.healthy.complete(request)
        } else {
            self.broken.complete(request)
        }
    }
}

#[test]
fn fired_deadline_does_not_leak_into_the_next_assessment() {
    let backend = Arc::new(RecoveringBackend {
        broken: RoutedBackend::new([
            (FlowId::Description, Err(BackendErrorKind::ServerError)),
            (FlowId::Categorization, Err(BackendErrorKind::ServerError)),
            (FlowId::Review, Err(BackendErrorKind::ServerError)),
        ]),
        healthy: RoutedBackend::new([
            (FlowId::Description, Ok(DESCRIPTION)),
            (FlowId::Categorization, Ok(CONFIDENT)),
            (FlowId::Review, Ok(APPROVE)),
        ]),
        recovered: AtomicBool::new(false),
    });
    let mut config = default_config();
    config.invocation.backoff_base_ms = 5_000;
    let pipeline = Pipeline::new(backend.clone(), Arc::new(MemoryObserver::default()), config)
        .with_deadline(std::time::Duration::from_millis(50));

    let first = pipeline.assess("slow-1", &mug_draft()).expect("first");
    assert!(first.failures.iter().all(|f| f.kind == "cancelled"));

    backend.recover();
    let second = pipeline.assess("fast-2", &mug_draft()).expect("second");
    assert!(second.failures.is_empty(), "{:?}", second.failures);
    assert_eq!(second.status, ListingStatus::Ready);
}

#[test]
fn status_serializes_snake_case() {
    assert_eq!(
        serde_json::to_value(ListingStatus::NeedsHumanReview).expect("serialize"),
        "needs_human_review"
    );
}
