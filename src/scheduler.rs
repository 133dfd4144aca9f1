//! The single executor shared by every processor and link of a database.
//!
//! A [`Scheduler`] lazily builds one bounded multi-threaded tokio runtime the first
//! time work is submitted. Work is either run as soon as possible, after a delay, or
//! periodically. Every task checks the scheduler's `active` flag at the moment it
//! fires, so timers that race a shutdown simply do nothing. Panics inside tasks are
//! caught and logged at this boundary and never take down a worker.

use std::{
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    runtime::{Builder, Handle, Runtime},
    select,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Cancels a periodic task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    token: CancellationToken,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
pub struct Scheduler {
    worker_threads: usize,
    max_blocking_threads: usize,
    runtime: Mutex<Option<Runtime>>,
    active: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

/// Run a task, logging rather than propagating any panic
fn run_guarded<F: FnOnce()>(task: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic>".to_string());
        error!("Scheduled task panicked: {message}");
    }
}

impl Scheduler {
    pub fn new(worker_threads: usize, max_blocking_threads: usize) -> Self {
        Scheduler {
            worker_threads: worker_threads.max(1),
            max_blocking_threads: max_blocking_threads.max(1),
            runtime: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Has [`Scheduler::shutdown`] been called
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Get a handle to the runtime, building it on first use
    fn handle(&self) -> Option<Handle> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        let mut runtime = self.runtime.lock().unwrap();
        if runtime.is_none() {
            debug!(
                "Starting scheduler with {} workers, {} blocking threads",
                self.worker_threads, self.max_blocking_threads
            );
            match Builder::new_multi_thread()
                .worker_threads(self.worker_threads)
                .max_blocking_threads(self.max_blocking_threads)
                .thread_name("pvdb-worker")
                .enable_time()
                .build()
            {
                Ok(rt) => *runtime = Some(rt),
                Err(e) => {
                    error!("Could not start scheduler runtime: {e}");
                    return None;
                }
            }
        }
        runtime.as_ref().map(|rt| rt.handle().clone())
    }

    /// A token that is cancelled when the scheduler shuts down
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Run `task` on the pool, immediately if `delay` is zero or after `delay`.
    ///
    /// Returns false if the scheduler has shut down and the task was discarded. A
    /// task that fires while the scheduler is inactive is silently dropped.
    pub fn schedule<F>(&self, task: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(handle) = self.handle() else {
            trace!("Scheduler is shut down, discarding task");
            return false;
        };
        let active = self.active.clone();
        let stop = self.shutdown.clone();
        handle.spawn(async move {
            if !delay.is_zero() {
                select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(delay) => (),
                }
            }
            if !active.load(Ordering::SeqCst) || stop.is_cancelled() {
                trace!("Scheduler inactive, skipping task");
                return;
            }
            run_guarded(task);
        });
        true
    }

    /// Run `task` every `period`, first after `delay`, until the handle is cancelled
    pub fn schedule_periodic(
        &self,
        task: Arc<dyn Fn() + Send + Sync>,
        delay: Duration,
        period: Duration,
    ) -> TaskHandle {
        let token = self.shutdown.child_token();
        let Some(handle) = self.handle() else {
            token.cancel();
            return TaskHandle { token };
        };
        let active = self.active.clone();
        let inner_token = token.clone();
        let period = period.max(Duration::from_millis(1));
        handle.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                select! {
                    _ = inner_token.cancelled() => break,
                    _ = interval.tick() => {
                        if active.load(Ordering::SeqCst) {
                            run_guarded(|| task());
                        }
                    }
                }
            }
        });
        TaskHandle { token }
    }

    /// Spawn a long-lived background loop onto the pool
    ///
    /// The future should watch a token from [`Scheduler::child_token`] so that it
    /// ends with the scheduler.
    pub fn spawn<F>(&self, future: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle().map(|h| h.spawn(future))
    }

    /// Stop all timers and tear down the runtime without waiting for running tasks
    pub fn shutdown(&self) {
        self.set_active(false);
        self.shutdown.cancel();
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            debug!("Shutting down scheduler runtime");
            runtime.shutdown_background();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        thread,
    };

    use super::*;

    #[test]
    fn runs_immediate_and_delayed_tasks() {
        let scheduler = Scheduler::new(2, 2);
        scheduler.set_active(true);
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        assert!(scheduler.schedule(move || tx.send("later").unwrap(), Duration::from_millis(30)));
        assert!(scheduler.schedule(move || tx2.send("now").unwrap(), Duration::ZERO));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "now");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "later");
    }

    #[test]
    fn inactive_scheduler_drops_tasks() {
        let scheduler = Scheduler::new(1, 1);
        scheduler.set_active(true);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler.schedule(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(50),
        );
        scheduler.set_active(false);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn periodic_until_cancelled() {
        let scheduler = Scheduler::new(1, 1);
        scheduler.set_active(true);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = scheduler.schedule_periodic(
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::ZERO,
            Duration::from_millis(10),
        );
        thread::sleep(Duration::from_millis(100));
        handle.cancel();
        thread::sleep(Duration::from_millis(30));
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 3, "only ran {seen} times");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn panicking_task_does_not_kill_pool() {
        let scheduler = Scheduler::new(1, 1);
        scheduler.set_active(true);
        scheduler.schedule(|| panic!("boom"), Duration::ZERO);
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(move || tx.send(()).unwrap(), Duration::from_millis(10));
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn shutdown_discards_new_work() {
        let scheduler = Scheduler::new(1, 1);
        scheduler.set_active(true);
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        assert!(!scheduler.schedule(|| (), Duration::ZERO));
        assert!(
            scheduler
                .schedule_periodic(Arc::new(|| ()), Duration::ZERO, Duration::from_millis(5))
                .is_cancelled()
        );
    }
}
