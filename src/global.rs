//! The process-global notification executor.
//!
//! Promises that are not associated with an event loop still need a
//! thread to run their listeners on; this single lazily-started thread is
//! it. It also completes group termination futures, which must outlive
//! the loops they describe. The thread drains a wait-free queue and parks
//! when idle.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread, ThreadId};

use crossbeam_queue::SegQueue;
use tracing::error;

use crate::promise::NotifyHandle;

type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct GlobalExecutor {
    queue: SegQueue<Job>,
    idle: AtomicBool,
    thread: OnceLock<Thread>,
    thread_id: OnceLock<ThreadId>,
}

/// The shared instance, starting its thread on first use.
pub(crate) fn handle() -> Arc<GlobalExecutor> {
    static INSTANCE: OnceLock<Arc<GlobalExecutor>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| {
            let exec = Arc::new(GlobalExecutor {
                queue: SegQueue::new(),
                idle: AtomicBool::new(false),
                thread: OnceLock::new(),
                thread_id: OnceLock::new(),
            });
            let worker = exec.clone();
            let handle = thread::Builder::new()
                .name("gyre-notify".into())
                .spawn(move || worker.run())
                .expect("failed to spawn the global notification thread");
            exec.thread
                .set(handle.thread().clone())
                .expect("global executor started twice");
            exec
        })
        .clone()
}

impl GlobalExecutor {
    fn run(&self) {
        self.thread_id
            .set(thread::current().id())
            .expect("global executor thread started twice");
        loop {
            while let Some(job) = self.queue.pop() {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                    error!(?panic, "notification job panicked");
                }
            }
            self.idle.store(true, Ordering::Release);
            // Recheck to avoid a lost wakeup between the drain and the park.
            if !self.queue.is_empty() {
                self.idle.store(false, Ordering::Release);
                continue;
            }
            thread::park();
            self.idle.store(false, Ordering::Release);
        }
    }
}

impl NotifyHandle for GlobalExecutor {
    fn is_executor_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    fn execute_notification(&self, job: Job) {
        self.queue.push(job);
        if self.idle.swap(false, Ordering::Acquire) {
            if let Some(t) = self.thread.get() {
                t.unpark();
            }
        }
    }
}
