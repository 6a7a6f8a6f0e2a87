//! Single-assignment futures with listener chains.
//!
//! Every asynchronous operation in the crate (submission, scheduling,
//! registration, shutdown) hands back a [`Future`], the read side of a
//! [`Promise`]. A promise transitions exactly once into success, failure,
//! or cancellation; listeners registered before the transition are
//! notified in registration order afterwards, and listeners registered
//! after it are notified immediately under the same routing rule.
//!
//! Routing: each promise is associated with an executor at construction
//! (the loop that created it, or the process-global notification executor
//! for free-standing promises). If the completing thread *is* that
//! executor's thread, listeners run inline; otherwise a single
//! notification job is enqueued on the executor. Listener panics are
//! caught and reported, never disturbing sibling listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::error::{Error, Result};
use crate::global;

/// Where a promise notifies its listeners. Implemented by event loops and
/// by the global notification executor.
pub(crate) trait NotifyHandle: Send + Sync {
    /// True when the calling thread is the executor's own thread.
    fn is_executor_thread(&self) -> bool;
    /// Enqueues a notification job. Implementations that can no longer
    /// accept work must still run the job somewhere (listeners are
    /// notified exactly once, even across shutdown).
    fn execute_notification(&self, job: Box<dyn FnOnce() + Send>);
}

/// Identifies a listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// A boxed completion callback, invoked with the finished future.
pub type Listener<V> = Box<dyn FnOnce(&Future<V>) + Send>;

enum Outcome<V> {
    Success(V),
    Failure(Error),
    Cancelled(Error),
}

struct CellState<V> {
    outcome: Option<Outcome<V>>,
    listeners: Vec<(ListenerId, Listener<V>)>,
    next_listener_id: u64,
    uncancellable: bool,
}

struct Inner<V> {
    cell: Mutex<CellState<V>>,
    done: Condvar,
    executor: Arc<dyn NotifyHandle>,
}

/// The read side: query the outcome, block for it, or chain listeners.
pub struct Future<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Future<V> {
    fn clone(&self) -> Self {
        Future {
            inner: self.inner.clone(),
        }
    }
}

/// The write side. Dereferences to [`Future`] for all read operations.
pub struct Promise<V> {
    future: Future<V>,
}

impl<V> Clone for Promise<V> {
    fn clone(&self) -> Self {
        Promise {
            future: self.future.clone(),
        }
    }
}

impl<V> std::ops::Deref for Promise<V> {
    type Target = Future<V>;
    fn deref(&self) -> &Future<V> {
        &self.future
    }
}

impl<V: Send + 'static> Default for Promise<V> {
    fn default() -> Self {
        Promise::new()
    }
}

impl<V: Send + 'static> Promise<V> {
    /// A free-standing promise, notified through the global executor.
    pub fn new() -> Self {
        Self::with_handle(global::handle())
    }

    pub(crate) fn with_handle(executor: Arc<dyn NotifyHandle>) -> Self {
        Promise {
            future: Future {
                inner: Arc::new(Inner {
                    cell: Mutex::new(CellState {
                        outcome: None,
                        listeners: Vec::new(),
                        next_listener_id: 0,
                        uncancellable: false,
                    }),
                    done: Condvar::new(),
                    executor,
                }),
            },
        }
    }

    /// A handle carrying only the read side.
    pub fn future(&self) -> Future<V> {
        self.future.clone()
    }

    /// Completes with a value. Returns false if a terminal state was
    /// already set; nothing happens in that case.
    pub fn try_success(&self, value: V) -> bool {
        self.future.complete(Outcome::Success(value))
    }

    /// Completes with a failure cause. Returns false if already terminal.
    pub fn try_failure(&self, cause: Error) -> bool {
        self.future.complete(Outcome::Failure(cause))
    }

    /// Marks the promise as no longer cancellable. Returns true when the
    /// promise is incomplete (and now protected) or already completed
    /// without cancellation.
    pub fn set_uncancellable(&self) -> bool {
        let mut cell = self.future.inner.cell.lock();
        match &cell.outcome {
            None => {
                cell.uncancellable = true;
                true
            }
            Some(Outcome::Cancelled(_)) => false,
            Some(_) => true,
        }
    }
}

impl<V: Send + 'static> Future<V> {
    pub fn is_done(&self) -> bool {
        self.inner.cell.lock().outcome.is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.inner.cell.lock().outcome, Some(Outcome::Success(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.cell.lock().outcome, Some(Outcome::Cancelled(_)))
    }

    /// True while the promise can still transition to cancelled.
    pub fn is_cancellable(&self) -> bool {
        let cell = self.inner.cell.lock();
        cell.outcome.is_none() && !cell.uncancellable
    }

    /// The failure or cancellation cause, if the future ended that way.
    pub fn cause(&self) -> Option<Error> {
        match &self.inner.cell.lock().outcome {
            Some(Outcome::Failure(e)) | Some(Outcome::Cancelled(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// The success value without blocking. `None` means not done *or*
    /// done unsuccessfully; disambiguate with [`is_done`](Self::is_done).
    pub fn get_now(&self) -> Option<V>
    where
        V: Clone,
    {
        match &self.inner.cell.lock().outcome {
            Some(Outcome::Success(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Attempts to cancel. Succeeds only while the promise is incomplete
    /// and cancellable; listeners observe a cancellation cause. The
    /// interrupt flag is advisory and carried for parity with executors
    /// that support interruption.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let _ = may_interrupt;
        {
            let cell = self.inner.cell.lock();
            if cell.outcome.is_some() || cell.uncancellable {
                return false;
            }
        }
        self.complete(Outcome::Cancelled(Error::Cancelled))
    }

    /// Blocks until the future is done.
    ///
    /// Fails fast with [`Error::Deadlock`] when called from the thread of
    /// the associated executor: that thread is the only one that could
    /// complete the promise, so blocking it can never make progress.
    pub fn wait(&self) -> Result<()> {
        let mut cell = self.inner.cell.lock();
        if cell.outcome.is_some() {
            return Ok(());
        }
        if self.inner.executor.is_executor_thread() {
            return Err(Error::Deadlock);
        }
        while cell.outcome.is_none() {
            self.inner.done.wait(&mut cell);
        }
        Ok(())
    }

    /// Blocks until done or the timeout elapses; `Ok(false)` on expiry.
    /// A zero timeout never blocks.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let mut cell = self.inner.cell.lock();
        if cell.outcome.is_some() {
            return Ok(true);
        }
        if timeout.is_zero() {
            return Ok(false);
        }
        if self.inner.executor.is_executor_thread() {
            return Err(Error::Deadlock);
        }
        let deadline = Instant::now() + timeout;
        while cell.outcome.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let timed_out = self
                .inner
                .done
                .wait_for(&mut cell, deadline - now)
                .timed_out();
            if timed_out && cell.outcome.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Waits for completion and surfaces a failure or cancellation cause
    /// as the error.
    pub fn sync(&self) -> Result<()> {
        self.wait()?;
        match self.cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// Registers a listener, notified exactly once after the terminal
    /// transition. Already-done futures notify immediately under the
    /// usual routing rule.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce(&Future<V>) + Send + 'static,
    {
        let boxed: Listener<V> = Box::new(listener);
        let id;
        let fire_now = {
            let mut cell = self.inner.cell.lock();
            id = ListenerId(cell.next_listener_id);
            cell.next_listener_id += 1;
            if cell.outcome.is_none() {
                cell.listeners.push((id, boxed));
                None
            } else {
                Some(boxed)
            }
        };
        if let Some(listener) = fire_now {
            self.notify(vec![(id, listener)]);
        }
        id
    }

    pub fn add_listeners<I>(&self, listeners: I) -> Vec<ListenerId>
    where
        I: IntoIterator<Item = Listener<V>>,
    {
        listeners
            .into_iter()
            .map(|l| self.add_listener_boxed(l))
            .collect()
    }

    fn add_listener_boxed(&self, listener: Listener<V>) -> ListenerId {
        self.add_listener(move |f| listener(f))
    }

    /// Removes a pending listener. Has no effect once the listener was
    /// already scheduled for notification.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut cell = self.inner.cell.lock();
        let before = cell.listeners.len();
        cell.listeners.retain(|(lid, _)| *lid != id);
        cell.listeners.len() != before
    }

    /// Performs the single terminal transition and schedules listener
    /// notification. Exactly one call over the promise's lifetime
    /// returns true.
    fn complete(&self, outcome: Outcome<V>) -> bool {
        let listeners = {
            let mut cell = self.inner.cell.lock();
            if cell.outcome.is_some() {
                return false;
            }
            cell.outcome = Some(outcome);
            std::mem::take(&mut cell.listeners)
        };
        self.inner.done.notify_all();
        if !listeners.is_empty() {
            self.notify(listeners);
        }
        true
    }

    /// Runs listeners inline when already on the associated executor's
    /// thread, otherwise as one enqueued job that walks the whole batch.
    fn notify(&self, listeners: Vec<(ListenerId, Listener<V>)>) {
        let future = self.clone();
        let job = move || {
            for (_, listener) in listeners {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&future))) {
                    error!(?panic, "future listener panicked");
                }
            }
        };
        if self.inner.executor.is_executor_thread() {
            job();
        } else {
            self.inner.executor.execute_notification(Box::new(job));
        }
    }
}

impl<V> std::fmt::Debug for Future<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cell = self.inner.cell.lock();
        let state = match &cell.outcome {
            None => "incomplete",
            Some(Outcome::Success(_)) => "success",
            Some(Outcome::Failure(_)) => "failure",
            Some(Outcome::Cancelled(_)) => "cancelled",
        };
        f.debug_struct("Future").field("state", &state).finish()
    }
}

impl<V> std::fmt::Debug for Promise<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.future.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn terminal_transition_happens_once() {
        let p = Promise::<u32>::new();
        assert!(p.try_success(7));
        assert!(!p.try_success(8));
        assert!(!p.try_failure(Error::Cancelled));
        assert!(!p.cancel(false));
        assert_eq!(p.get_now(), Some(7));
    }

    #[test]
    fn cancel_respects_uncancellable() {
        let p = Promise::<()>::new();
        assert!(p.is_cancellable());
        assert!(p.set_uncancellable());
        assert!(!p.is_cancellable());
        assert!(!p.cancel(false));
        assert!(p.try_success(()));
    }

    #[test]
    fn sync_surfaces_the_stored_cause() {
        let p = Promise::<()>::new();
        p.try_failure(Error::IllegalState("boom"));
        assert!(matches!(p.sync(), Err(Error::IllegalState("boom"))));

        let c = Promise::<()>::new();
        assert!(c.cancel(false));
        assert!(matches!(c.sync(), Err(Error::Cancelled)));
        assert!(c.cause().is_some());
    }

    #[test]
    fn zero_timeout_never_blocks() {
        let p = Promise::<()>::new();
        assert!(!p.wait_timeout(Duration::ZERO).unwrap());
        p.try_success(());
        assert!(p.wait_timeout(Duration::ZERO).unwrap());
    }

    #[test]
    fn removed_listener_is_never_notified() {
        let p = Promise::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = p.add_listener(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(p.remove_listener(id));
        assert!(!p.remove_listener(id));
        p.try_success(());
        p.wait().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
