use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

/// Pending auto-resolve timers keyed by alert id.
///
/// Each timer leaves the map exactly once: through [`cancel`](Self::cancel)
/// or through [`claim`](Self::claim) when it fires. Whichever comes second
/// finds nothing and does nothing.
pub struct AutoResolveTimers {
    pending: Mutex<HashMap<Uuid, AbortHandle>>,
}

impl AutoResolveTimers {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Uuid, AbortHandle>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `on_fire` after `delay` unless cancelled first. Replaces (and
    /// aborts) any timer already pending for the alert.
    pub fn schedule<F>(&self, alert_id: Uuid, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Insert under the lock so a zero delay cannot fire before it is tracked.
        let mut pending = self.pending();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire.await;
        });
        if let Some(previous) = pending.insert(alert_id, task.abort_handle()) {
            previous.abort();
        }
        debug!(alert_id = %alert_id, delay_secs = delay.as_secs(), "Auto-resolve scheduled");
    }

    /// Stops a pending timer. False if it already fired or was cancelled.
    pub fn cancel(&self, alert_id: Uuid) -> bool {
        match self.pending().remove(&alert_id) {
            Some(handle) => {
                handle.abort();
                debug!(alert_id = %alert_id, "Auto-resolve cancelled");
                true
            }
            None => false,
        }
    }

    /// Called by a firing timer. False means it was cancelled meanwhile.
    pub fn claim(&self, alert_id: Uuid) -> bool {
        self.pending().remove(&alert_id).is_some()
    }

    #[cfg(test)]
    pub fn is_scheduled(&self, alert_id: Uuid) -> bool {
        self.pending().contains_key(&alert_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending().len()
    }
}
