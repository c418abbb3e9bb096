//! Worker thread management utilities.
//!
//! Three primitives back every piece of background work in the crate:
//!
//! - [`WorkerPool`] — a fixed set of named threads draining a shared job
//!   queue. The disk tier runs completion-based operations on a small
//!   concurrent pool; single-worker pools serve as serial queues (deferred
//!   value release, trash draining).
//! - [`Trimmer`] — a self-rescheduling timer thread that fires a tick
//!   callback at a (runtime-adjustable) interval. The tick holds only a
//!   weak reference to its tier, so a dropped tier stops its timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of named worker threads fed by an unbounded queue.
///
/// Jobs submitted after the pool is dropped are discarded; drop joins all
/// workers after the queue drains.
pub(crate) struct WorkerPool {
    tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` worker threads named `{name_prefix}-{n}`.
    pub fn new(name_prefix: &str, size: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(size);

        for worker_id in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name_prefix, worker_id))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            tx: Some(tx),
            handles,
        }
    }

    /// Enqueue a job. No-op once the pool has shut down.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Box::new(job));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain remaining jobs and exit.
        self.tx.take();
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            // A job may hold the last strong reference to its owner; if that
            // drop runs on a pool thread, joining ourselves would deadlock.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

/// A periodic timer thread driving background trims.
///
/// The interval is read from a shared atomic (milliseconds) on every
/// rescheduling, so runtime configuration changes take effect on the next
/// tick. The tick callback returns `false` to stop the timer for good
/// (its tier is gone).
pub(crate) struct Trimmer {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Trimmer {
    pub fn spawn<F>(name: &str, interval_ms: Arc<AtomicU64>, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                // Clamp to a day so an "unbounded" interval cannot overflow
                // the deadline arithmetic inside recv_timeout.
                let ms = interval_ms.load(Ordering::Relaxed).min(86_400_000);
                match rx.recv_timeout(Duration::from_millis(ms)) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !tick() {
                            break;
                        }
                    }
                    // Shutdown signal or the owner dropped the sender.
                    _ => break,
                }
            })
            .expect("failed to spawn trim timer thread");

        Self {
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }
}

impl Drop for Trimmer {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_worker_pool_runs_jobs() {
        let pool = WorkerPool::new("test-pool", 2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        // Drop joins the workers after the queue drains.
        drop(pool);
        assert_eq!(counter.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn test_worker_pool_serial_ordering() {
        let pool = WorkerPool::new("test-serial", 1);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..16 {
            let log = Arc::clone(&log);
            pool.execute(move || log.lock().push(i));
        }

        drop(pool);
        let log = log.lock();
        assert_eq!(*log, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_trimmer_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let interval = Arc::new(AtomicU64::new(10));

        let trimmer = {
            let ticks = Arc::clone(&ticks);
            Trimmer::spawn("test-trim", interval, move || {
                ticks.fetch_add(1, Ordering::Relaxed) < 2
            })
        };

        std::thread::sleep(Duration::from_millis(200));
        let seen = ticks.load(Ordering::Relaxed);
        assert!(seen >= 3, "expected at least 3 ticks, saw {}", seen);
        // Tick returned false after the third firing; count must be stable.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(ticks.load(Ordering::Relaxed), seen);
        drop(trimmer);
    }

    #[test]
    fn test_trimmer_shutdown_before_first_tick() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let interval = Arc::new(AtomicU64::new(60_000));

        let trimmer = {
            let ticks = Arc::clone(&ticks);
            Trimmer::spawn("test-trim-idle", interval, move || {
                ticks.fetch_add(1, Ordering::Relaxed);
                true
            })
        };

        drop(trimmer);
        assert_eq!(ticks.load(Ordering::Relaxed), 0);
    }
}
