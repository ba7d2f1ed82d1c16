use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, SyncError};

/// Cooperative cancellation flag shared between a sync caller and the engine.
///
/// The engine checks it at loop boundaries (pagination, outbox draining,
/// row ingest). Cancellation never rolls back completed store writes; each
/// write is standalone, so unwinding leaves the store consistent.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn err_if_interrupted(&self) -> Result<()> {
        if self.is_interrupted() {
            return Err(SyncError::Interrupted);
        }
        Ok(())
    }
}
