//! Cooperative cancellation for generation sessions.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A reusable stop flag shared between a generation loop and whoever may
/// interrupt it.
///
/// The loop polls [`should_stop`](Self::should_stop) between tokens; it is
/// never interrupted mid-token. The flag stays raised until
/// [`reset`](Self::reset) is called, so a controller that is not reset
/// stops the next session on its first poll.
#[derive(Debug, Default, Clone)]
pub struct StoppingController {
    interrupted: Arc<AtomicBool>,
}

impl StoppingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_stop(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Raise the stop flag. A no-op if nothing is generating.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.interrupted.store(false, Ordering::Release);
    }
}
