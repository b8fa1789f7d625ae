// Shared timer scheduler
//
// An explicit handle passed into every component that needs timed work.
// Teardown is explicit: stop() flips the shutdown signal and aborts all
// outstanding timers. There is no process-wide singleton.

use parking_lot::Mutex;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cheap to clone; all clones share the same shutdown signal and task set.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Run `fut` once after `delay`, unless the scheduler stops first.
    pub fn schedule_once<F>(&self, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => fut.await,
                _ = shutdown.changed() => {}
            }
        });
        self.track(handle);
    }

    /// Run `f` repeatedly. Each interval is `base` scaled by a uniform
    /// factor in `[1 - jitter, 1 + jitter]`; pass 0.0 for a fixed period.
    pub fn schedule_repeating<F, Fut>(&self, base: Duration, jitter: f64, mut f: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut shutdown = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            loop {
                let delay = jittered(base, jitter);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => f().await,
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.track(handle);
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Signal shutdown and abort every outstanding timer task.
    pub fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        let mut tasks = self.inner.tasks.lock();
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
    base.mul_f64(factor)
}
