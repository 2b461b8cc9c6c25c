//! Thread plumbing: serial executors and countdown latches.
//!
//! The runtime is multi-threaded with explicit serialization boundaries:
//! one serial executor per client for the PCP control plane, one for the
//! endpoint manager's bookkeeping, and one per payload type for writers.
//! An executor is a single worker thread draining a job queue; posting is
//! non-blocking, and [`SerialExecutor::run_and_wait`] lets public API
//! methods post work and await its result.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single worker thread executing posted jobs in order.
pub struct SerialExecutor {
    tx: Option<Sender<Job>>,
    thread_id: thread::ThreadId,
    handle: Option<thread::JoinHandle<()>>,
}

impl SerialExecutor {
    pub fn new(name: &str) -> SerialExecutor {
        let (tx, rx) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .expect("failed to spawn executor thread");
        SerialExecutor {
            tx: Some(tx),
            thread_id: handle.thread().id(),
            handle: Some(handle),
        }
    }

    /// Whether the calling thread is this executor's worker.
    pub fn on_executor_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Posts a job. Jobs posted after shutdown are dropped.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Box::new(job));
        }
    }

    /// Posts a job and blocks until it ran, returning its result. Calls
    /// from the executor's own thread run inline so a posted job can safely
    /// call back into its executor.
    pub fn run_and_wait<R, F>(&self, job: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.on_executor_thread() {
            return job();
        }
        let (result_tx, result_rx) = bounded(1);
        self.execute(move || {
            let _ = result_tx.send(job());
        });
        result_rx.recv().expect("serial executor terminated")
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if thread::current().id() != self.thread_id {
                let _ = handle.join();
            }
        }
    }
}

/// A latch that blocks waiters until it was counted down to zero.
pub struct CountDownLatch {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Arc<CountDownLatch> {
        Arc::new(CountDownLatch {
            remaining: Mutex::new(count),
            cond: Condvar::new(),
        })
    }

    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            if *remaining == 0 {
                self.cond.notify_all();
            }
        }
    }

    /// Blocks until the latch reaches zero.
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.cond.wait(&mut remaining);
        }
    }

    /// Blocks up to `timeout`; returns whether the latch reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            if self.cond.wait_until(&mut remaining, deadline).timed_out() {
                return *remaining == 0;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn executes_in_order() {
        let executor = SerialExecutor::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = log.clone();
            executor.execute(move || log.lock().push(i));
        }
        let done: Vec<i32> = executor.run_and_wait({
            let log = log.clone();
            move || log.lock().clone()
        });
        assert_eq!(done, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn run_and_wait_returns_value() {
        let executor = SerialExecutor::new("test");
        assert_eq!(executor.run_and_wait(|| 6 * 7), 42);
    }

    #[test]
    fn nested_run_and_wait_does_not_deadlock() {
        let executor = Arc::new(SerialExecutor::new("test"));
        let inner = executor.clone();
        let value = executor.run_and_wait(move || inner.run_and_wait(|| 1) + 1);
        assert_eq!(value, 2);
    }

    #[test]
    fn latch_releases_at_zero() {
        let latch = CountDownLatch::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let latch = latch.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                latch.wait();
                counter.store(1, Ordering::SeqCst);
            })
        };
        latch.count_down();
        assert!(!latch.wait_timeout(Duration::from_millis(50)));
        latch.count_down();
        waiter.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(latch.wait_timeout(Duration::from_millis(1)));
    }
}
