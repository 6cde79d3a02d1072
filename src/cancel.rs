//! Cooperative cancellation.
//!
//! A poll-style boolean flag shared between the driver and the pipelines.
//! It is consulted at the top of each file loop, each enrichment key
//! iteration, and around the pacing sleep. Cancellation is not an error:
//! a cancelled run keeps everything imported so far.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; the flag is never cleared.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
