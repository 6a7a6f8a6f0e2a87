//! The single-thread executor core that every event loop composes.
//!
//! Holds the state shared across threads: the lifecycle word, the MPSC
//! task queue, the armed-wakeup word, and the termination promise. The
//! loop-thread-only pieces (timer heap, registrations, notifier) live
//! with the reactor; this module is the cross-thread contract.
//!
//! Lifecycle transitions are monotonic:
//! not-started → started → shutting-down → shutdown → terminated.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};
use std::time::Duration;

use metrics::{counter, gauge};

use crate::error::{Error, Result};
use crate::promise::{Future, Promise};
use crate::queue::TaskQueue;
use crate::scheduled::AWAKE;

pub(crate) type Runnable = Box<dyn FnOnce() + Send + 'static>;

pub(crate) const ST_NOT_STARTED: u8 = 1;
pub(crate) const ST_STARTED: u8 = 2;
pub(crate) const ST_SHUTTING_DOWN: u8 = 3;
pub(crate) const ST_SHUTDOWN: u8 = 4;
pub(crate) const ST_TERMINATED: u8 = 5;

/// Cross-thread executor state. One per loop.
pub(crate) struct ExecutorCore {
    pub state: AtomicU8,
    pub queue: TaskQueue<Runnable>,
    /// AWAKE while the loop runs, NONE while it waits unbounded, else the
    /// deadline it armed before blocking.
    pub wakeup_state: AtomicI64,
    pub quiet_period_ns: AtomicI64,
    pub shutdown_timeout_ns: AtomicI64,
    pub termination: Promise<()>,
    pub thread_id: OnceLock<ThreadId>,
    /// Observable count of notifier wakeups actually issued.
    pub wakeups_issued: AtomicU64,
}

impl ExecutorCore {
    pub fn new(max_pending_tasks: usize) -> Self {
        ExecutorCore {
            state: AtomicU8::new(ST_NOT_STARTED),
            queue: TaskQueue::with_capacity(max_pending_tasks),
            wakeup_state: AtomicI64::new(AWAKE),
            quiet_period_ns: AtomicI64::new(0),
            shutdown_timeout_ns: AtomicI64::new(0),
            termination: Promise::with_handle(crate::global::handle()),
            thread_id: OnceLock::new(),
            wakeups_issued: AtomicU64::new(0),
        }
    }

    pub fn in_event_loop(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() >= ST_SHUTTING_DOWN
    }

    pub fn is_shutdown(&self) -> bool {
        self.state() >= ST_SHUTDOWN
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ST_TERMINATED
    }

    pub fn termination_future(&self) -> Future<()> {
        self.termination.future()
    }

    /// Monotonic transition; returns false when another thread already
    /// moved the state at or past the target.
    pub fn advance_state(&self, target: u8) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur >= target {
                return false;
            }
            match self
                .state
                .compare_exchange(cur, target, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Enqueues a task, handing it back when the loop is shut down or a
    /// bounded queue is exhausted.
    pub fn try_offer(&self, task: Runnable) -> std::result::Result<(), Runnable> {
        if self.is_shutdown() {
            return Err(task);
        }
        self.queue.offer(task)?;
        counter!("gyre_tasks_submitted_total").increment(1);
        gauge!("gyre_pending_tasks").set(self.queue.len() as f64);
        Ok(())
    }

    /// [`try_offer`](Self::try_offer) with the refusal turned into an
    /// error.
    pub fn offer(&self, task: Runnable) -> Result<()> {
        match self.try_offer(task) {
            Ok(()) => Ok(()),
            Err(_) if self.is_shutdown() => Err(Error::IllegalState("event loop shut down")),
            Err(_) => Err(Error::IllegalState("task queue full")),
        }
    }

    pub fn has_tasks(&self) -> bool {
        !self.queue.is_empty()
    }

    /// The producer half of the wakeup protocol: swing the armed word to
    /// AWAKE; only the producer that won the transition touches the
    /// notifier. Returns true when the caller must wake.
    pub fn claim_wakeup(&self) -> bool {
        if self.wakeup_state.swap(AWAKE, Ordering::AcqRel) != AWAKE {
            self.wakeups_issued.fetch_add(1, Ordering::Relaxed);
            counter!("gyre_wakeups_total").increment(1);
            true
        } else {
            false
        }
    }

    pub fn record_shutdown_window(&self, quiet_period: Duration, timeout: Duration) {
        self.quiet_period_ns
            .store(duration_nanos(quiet_period), Ordering::Release);
        self.shutdown_timeout_ns
            .store(duration_nanos(timeout), Ordering::Release);
    }
}

pub(crate) fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Submission, scheduling, and lifecycle: the executor face of a loop.
pub trait Executor {
    /// Runs a task on the loop thread, in submission order with respect
    /// to other tasks enqueued from the same thread.
    fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static;

    /// Like [`execute`](Self::execute), with a future for the result.
    fn submit<T, F>(&self, task: F) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static;

    /// Runs a task after `delay` on the loop thread. Cancelling the
    /// returned future drops the task on a best-effort basis.
    fn schedule<T, F>(&self, task: F, delay: Duration) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static;

    /// True on the loop's own thread.
    fn in_event_loop(&self) -> bool;

    /// Initiates graceful shutdown: the loop keeps accepting tasks until
    /// `quiet_period` has passed since the last one ran, hard-capped by
    /// `timeout`, then terminates. Returns the termination future.
    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Future<()>;

    fn termination_future(&self) -> Future<()>;
    fn is_shutting_down(&self) -> bool;
    fn is_shutdown(&self) -> bool;
    fn is_terminated(&self) -> bool;
}
