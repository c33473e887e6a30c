use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A one-shot, level-triggered signal shared between a slot's workers.
///
/// Mirrors a `multiprocessing.Event`: any number of tasks can wait on it,
/// `set` wakes everyone currently waiting (and anyone who asks later sees it
/// immediately), and `clear` puts it back to the unset state ahead of a new
/// incarnation. There is no lock on the read path — `is_set` is a single
/// atomic load.
#[derive(Default)]
pub struct Flag {
    set: AtomicBool,
    notify: Notify,
}

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.set.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.set.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Resolves once the flag has been set. Safe to call before or after
    /// `set()` — a flag that is already set resolves immediately.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }

            let notified = self.notify.notified();

            // Re-check after registering interest, closing the race where
            // `set` fires between the first check and `notified()`.
            if self.is_set() {
                return;
            }

            notified.await;
        }
    }
}
