//! Single-slot cancellable timer for the session auto-reset.

use crossbeam::channel::{self, Sender};
use crossbeam::select;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// At most one pending callback. Scheduling replaces (and cancels) the
/// previous one; dropping the cancel sender wakes the waiting thread.
#[derive(Default)]
pub struct ResetTimer {
    cancel: Mutex<Option<Sender<()>>>,
}

impl ResetTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F>(&self, delay: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(0);
        let previous = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel_tx);
        drop(previous);

        let spawned = thread::Builder::new()
            .name("toolcrib-reset".to_string())
            .spawn(move || {
                select! {
                    recv(cancel_rx) -> _ => debug!("Auto-reset cancelled"),
                    recv(channel::after(delay)) -> _ => fire(),
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "Failed to spawn auto-reset timer");
        }
    }

    pub fn cancel(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        let make = move || {
            let count = Arc::clone(&shared);
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>
        };
        (count, make)
    }

    #[test]
    fn fires_after_delay() {
        let timer = ResetTimer::new();
        let (count, make) = counter();
        timer.schedule(Duration::from_millis(20), make());

        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_firing() {
        let timer = ResetTimer::new();
        let (count, make) = counter();
        timer.schedule(Duration::from_millis(100), make());
        timer.cancel();

        thread::sleep(Duration::from_millis(250));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rescheduling_replaces_previous() {
        let timer = ResetTimer::new();
        let (count, make) = counter();
        timer.schedule(Duration::from_millis(100), make());
        timer.schedule(Duration::from_millis(100), make());

        thread::sleep(Duration::from_millis(300));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
