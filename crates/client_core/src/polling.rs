use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Fetch,
    Skip,
}

/// Decides whether the fallback poll should fetch, based on whether push delivery has been seen
/// working since the last health reset. Starts unhealthy.
#[derive(Debug, Default)]
pub struct PollingFallbackController {
    push_healthy: AtomicBool,
}

impl PollingFallbackController {
    pub fn new() -> Self {
        Self::default()
    }

    /// A push message for the open conversation arrived.
    pub fn record_push_activity(&self) {
        if !self.push_healthy.swap(true, Ordering::SeqCst) {
            debug!("polling: push delivery healthy, pausing fallback fetches");
        }
    }

    /// Forget past push activity; push has to prove itself again before polls are skipped.
    pub fn reset_health(&self) {
        if self.push_healthy.swap(false, Ordering::SeqCst) {
            debug!("polling: push health expired, fallback fetches resume");
        }
    }

    pub fn is_push_healthy(&self) -> bool {
        self.push_healthy.load(Ordering::SeqCst)
    }

    pub fn should_poll(&self) -> PollDecision {
        if self.is_push_healthy() {
            PollDecision::Skip
        } else {
            PollDecision::Fetch
        }
    }
}
