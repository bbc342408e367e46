//! Deferred expiry checks, one per open group order.
//!
//! Each group gets exactly one timer task at creation. Firing is harmless
//! when late or duplicated (the ledger's close path is idempotent), so
//! cancellation on early completion is best-effort only.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
pub struct ExpiryScheduler {
    handles: Mutex<HashMap<String, tokio::task::AbortHandle>>,
}

impl ExpiryScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Schedules `fire` after `delay` for the given group. A zero delay
    /// (past-due deadline discovered during restart recovery) fires on the
    /// next tick.
    pub fn schedule<F>(self: &Arc<Self>, group_id: &str, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scheduler = Arc::clone(self);
        let id = group_id.to_string();
        let task_id = id.clone();
        // The map lock is held across spawn and insert so a zero-delay task
        // cannot reach its self-removal before its handle is registered.
        let mut handles = self.handles.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
            scheduler.handles.lock().remove(&task_id);
        });
        debug!(group_id = %id, delay_secs = delay.as_secs(), "expiry check scheduled");
        if let Some(old) = handles.insert(id, handle.abort_handle()) {
            // One timer per group; replacing implies a programming error
            // upstream, but the idempotent close path makes it harmless.
            old.abort();
        }
    }

    /// Best-effort cancellation when a group completes before its deadline.
    pub fn cancel(&self, group_id: &str) {
        if let Some(handle) = self.handles.lock().remove(group_id) {
            handle.abort();
            debug!(group_id = %group_id, "expiry check cancelled");
        }
    }

    pub fn pending(&self) -> usize {
        self.handles.lock().len()
    }
}
