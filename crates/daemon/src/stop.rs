//! Graceful-stop flag polled between units of work.
//!
//! A unit of work already in flight always runs to completion; the flag is
//! only checked at the top of the next loop iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, cheaply cloneable stop signal for a daemon's worker loop.
#[derive(Clone, Default)]
pub struct GracefulStop {
    flag: Arc<AtomicBool>,
}

impl GracefulStop {
    pub fn new() -> Self {
        GracefulStop { flag: Arc::new(AtomicBool::new(false)) }
    }

    /// Request that the next iteration of the loop stop.
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested. Call this between units of work,
    /// never in the middle of one.
    pub fn should_stop(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let stop = GracefulStop::new();
        assert!(!stop.should_stop());
    }

    #[test]
    fn stop_is_visible_across_clones() {
        let stop = GracefulStop::new();
        let clone = stop.clone();
        clone.request_stop();
        assert!(stop.should_stop());
    }
}
