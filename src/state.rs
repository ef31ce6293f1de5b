use crate::tracker::DigestTracker;
use std::sync::atomic::{AtomicBool, Ordering};

/// State shared between the reconciliation loop and the webserver.
#[derive(Debug, Default)]
pub struct ControllerState {
    tracker: DigestTracker,
    first_cycle_completed: AtomicBool,
}

impl ControllerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self) -> &DigestTracker {
        &self.tracker
    }

    pub fn mark_cycle_completed(&self) {
        self.first_cycle_completed.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.first_cycle_completed.load(Ordering::Acquire)
    }
}
