use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Progress update callbacks
///
/// Called once per acknowledged block, so a transfer of `n` bytes in blocks
/// of `size` produces exactly `n.div_ceil(size)` updates, each reporting the
/// running byte count.
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// Cooperative cancellation flag for a running transfer.
///
/// Clones observe the same flag, so one can live in a Ctrl-C handler while
/// the flasher polls another between blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the ongoing transfer to stop before its next block.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
