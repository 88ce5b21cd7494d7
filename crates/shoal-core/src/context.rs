//! Run context for background tasks
//!
//! Streamers and the tiered storage run off the foreground request path;
//! their errors are reported into a shared context instead of a caller.
//! The first error wins and flips the cancellation flag so future writes
//! short-circuit.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::error::OpStatus;

/// Shared cancellation + first-error context
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    error: Mutex<Option<OpStatus>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the first error and cancel. Later reports are dropped.
    pub fn report_error(&self, status: OpStatus) {
        let mut slot = self.inner.error.lock();
        if slot.is_none() {
            warn!(error = %status, "background context error");
            *slot = Some(status);
        }
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Cancel without recording an error
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The first reported error, if any
    pub fn error(&self) -> Option<OpStatus> {
        self.inner.error.lock().clone()
    }
}
