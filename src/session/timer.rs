//! Single-shot, re-armable idle timer.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct IdleTimer {
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl IdleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending deadline and run `on_fire` after `after`.
    ///
    /// `on_fire` runs on its own task, so it may re-arm or cancel this timer
    /// without aborting itself.
    pub fn arm<F>(&self, after: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            tokio::spawn(on_fire);
        });

        if let Some(previous) = self.pending.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(previous) = self.pending.lock().take() {
            previous.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
