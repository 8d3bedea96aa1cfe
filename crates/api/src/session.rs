//! View lifetime: owns every subscription a view opened and tears them down once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use console_store::{SubscriptionHandle, SubscriptionManager};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ViewSession {
    handles: Mutex<Vec<SubscriptionHandle>>,
    token: CancellationToken,
    torn_down: AtomicBool,
}

impl ViewSession {
    pub fn new() -> Self { Self::default() }

    /// Take ownership of a handle. Handles arriving after teardown are released at once.
    pub fn track(&self, handle: SubscriptionHandle) {
        if self.torn_down.load(Ordering::SeqCst) {
            handle.release();
            return;
        }
        self.lock().push(handle);
    }

    /// Token cancelled at teardown; view worker tasks stop on it.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_active(&self) -> bool {
        !self.torn_down.load(Ordering::SeqCst)
    }

    pub fn handle_count(&self) -> usize {
        self.lock().len()
    }

    /// Release every tracked handle and stop workers. Later calls do nothing.
    /// Returns the number of handles released by this call.
    pub fn teardown(&self) -> usize {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.token.cancel();
        let handles = std::mem::take(&mut *self.lock());
        let released = SubscriptionManager::release(handles.iter());
        debug!(released, "view session torn down");
        released
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SubscriptionHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ViewSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
