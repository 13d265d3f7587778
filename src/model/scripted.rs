use super::{BackendError, BackendErrorKind, ModelBackend, ModelRequest};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Canned-response backend for deterministic tests.
///
/// Replies are consumed in order; the last one repeats forever.
pub(crate) struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, BackendError>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicU32,
}

impl ScriptedBackend {
    pub(crate) fn new(replies: Vec<Result<String, BackendError>>) -> Self {
        assert!(!replies.is_empty(), "scripted backend needs a reply");
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn replying(text: &str) -> Self {
        Self::new(vec![Ok(text.to_string())])
    }

    pub(crate) fn failing(kind: BackendErrorKind) -> Self {
        Self::new(vec![Err(BackendError::new(kind, "scripted failure"))])
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().expect("prompts lock").last().cloned()
    }
}

impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(&self, request: &ModelRequest<'_>) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.prompt.to_string());
        let mut replies = self.replies.lock().expect("replies lock");
        if replies.len() > 1 {
            replies.pop_front().expect("non-empty replies")
        } else {
            replies.front().cloned().expect("non-empty replies")
        }
    }
}
