use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Shared flag the orchestrator fires to stop an invocation between attempts.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wakeup) = &*self.inner;
        *flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep for `duration` unless cancelled first. Returns true when cancelled.
    pub fn wait(&self, duration: Duration) -> bool {
        let (flag, wakeup) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut cancelled = flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*cancelled {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            cancelled = match wakeup.wait_timeout(cancelled, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}
