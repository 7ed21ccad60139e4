//! Priority worker pool for refresh jobs
//!
//! Refreshes run on a fixed pool of plain threads, sized to the machine by
//! default. Pending jobs sit in a priority queue rather than a FIFO:
//! non-exclusive jobs go before exclusive ones, cheaper caches (by prior
//! refresh cost) before expensive ones, and among equals the most recently
//! scheduled wins. That ordering drains quick interactive caches first and
//! batches the heavyweight exclusive work at the end.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::error::{LarderError, LarderResult};

static JOB_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A unit of refresh work with its scheduling attributes
pub(crate) struct RefreshJob {
    exclusive: bool,
    cost: Duration,
    seq: u64,
    work: Box<dyn FnOnce() + Send>,
}

impl RefreshJob {
    pub(crate) fn new(exclusive: bool, cost: Duration, work: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            exclusive,
            cost,
            seq: JOB_SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed),
            work,
        }
    }
}

impl PartialEq for RefreshJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RefreshJob {}

impl PartialOrd for RefreshJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RefreshJob {
    /// BinaryHeap pops the greatest element, so "greater" means "runs first"
    fn cmp(&self, other: &Self) -> Ordering {
        // Non-exclusive first, then cheaper, then most recently scheduled.
        other
            .exclusive
            .cmp(&self.exclusive)
            .then_with(|| other.cost.cmp(&self.cost))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct Queue {
    jobs: Mutex<BinaryHeap<RefreshJob>>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// Fixed-size pool of refresh worker threads
pub(crate) struct Scheduler {
    queue: Arc<Queue>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn new(workers: usize) -> LarderResult<Self> {
        let queue = Arc::new(Queue {
            jobs: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let mut handles = Vec::with_capacity(workers.max(1));
        for n in 0..workers.max(1) {
            let queue = Arc::clone(&queue);
            let handle = std::thread::Builder::new()
                .name(format!("larder-worker-{n}"))
                .spawn(move || worker_loop(&queue))
                .map_err(|e| LarderError::io(format!("spawning refresh worker {n}"), e))?;
            handles.push(handle);
        }
        Ok(Self {
            queue,
            workers: handles,
        })
    }

    pub(crate) fn submit(&self, job: RefreshJob) {
        let mut jobs = self
            .queue
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        jobs.push(job);
        drop(jobs);
        self.queue.available.notify_one();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.queue.shutdown.store(true, AtomicOrdering::SeqCst);
        self.queue.available.notify_all();
        // The drop may run on a worker itself, when a job releases the last
        // depot reference. That thread cannot join itself; it exits on its
        // own once the running job returns and the loop sees the shutdown
        // flag.
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                debug!("Refresh worker terminated by panic");
            }
        }
    }
}

fn worker_loop(queue: &Queue) {
    loop {
        let job = {
            let mut jobs = queue.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if queue.shutdown.load(AtomicOrdering::SeqCst) {
                    return;
                }
                if let Some(job) = jobs.pop() {
                    break job;
                }
                jobs = queue
                    .available
                    .wait(jobs)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        (job.work)();
    }
}
