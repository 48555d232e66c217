//! Cooperative cancellation shared between the orchestrator and controllers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Two-level cancellation flag.
///
/// `cancel` stops scheduling new work; `halt` additionally asks running
/// controllers to stop at their next step boundary. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    halted: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel and ask running work to stop. Implies `cancel`.
    pub fn halt(&self) {
        self.cancel();
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
        assert!(!clone.is_halted());

        token.halt();
        assert!(clone.is_halted());
    }
}
