//! The event loop: a single-thread executor specialized with an OS
//! readiness notifier.
//!
//! Each loop owns one `mio::Poll`, one registration table, one timer
//! heap, and one MPSC task queue, all driven by one thread. Registered
//! resources are pinned to their loop for life, so registration state is
//! mutated without locks; every foreign-thread operation funnels through
//! the task queue. One iteration of the loop body waits on the notifier
//! (bounded by the earliest timer deadline), dispatches the ready set,
//! then drains tasks under the configured I/O-to-task time ratio.
//!
//! Two well-known notifier pathologies are handled in place: a poll that
//! keeps returning without readiness or tasks is counted and, past the
//! configured threshold, the notifier is rebuilt out from under the
//! registrations; and stale cancelled entries are flushed with an extra
//! non-blocking poll once enough of them pile up.

pub mod registration;
mod ready;

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use mio::{Events, Poll, Token, Waker as MioWaker};
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use tracing::{debug, error, info, trace, warn};

use crate::config::{CLEANUP_INTERVAL, MIN_PREMATURE_RETURNS};
use crate::error::{Error, Result};
use crate::executor::{
    duration_nanos, Executor, ExecutorCore, Runnable, ST_NOT_STARTED, ST_SHUTDOWN,
    ST_SHUTTING_DOWN, ST_STARTED, ST_TERMINATED,
};
use crate::group::ThreadFactory;
use crate::ops::Ops;
use crate::promise::{Future, NotifyHandle, Promise};
use crate::scheduled::{mono_nanos, ScheduledEntry, AWAKE, NONE};

use self::ready::{ReadyKey, ReadyKeys};
use self::registration::{Attachment, ChannelIo, Entry, ReadyContext, ReadyTask, Registration, Selectable};

/// The notifier slot reserved for cross-thread wakeups.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Outcomes of the per-iteration strategy computation. Only `SELECT` is
/// produced by the default strategy; the others are reserved.
pub mod strategy {
    /// Proceed to the blocking wait.
    pub const SELECT: i64 = -1;
    /// Skip this iteration entirely.
    pub const CONTINUE: i64 = -2;
    /// Poll without blocking; folds into `SELECT` here.
    pub const BUSY_WAIT: i64 = -3;
}

/// Registration and notifier control: the reactor face of a loop.
pub trait Reactor {
    /// Binds a resource to this loop with the given interest set and a
    /// readiness callback. Fails synchronously with invalid-argument or
    /// shutdown errors; foreign-thread calls are funnelled onto the loop
    /// and awaited.
    fn register<S>(&self, source: S, ops: Ops, task: Box<dyn ReadyTask>) -> Result<Registration>
    where
        S: Selectable + 'static;

    /// Binds an internal channel, driven through [`ChannelIo`] by the
    /// dispatch loop.
    fn register_channel(&self, channel: Box<dyn ChannelIo>, ops: Ops) -> Result<Registration>;

    /// Live (non-cancelled) registrations on this loop.
    fn registered_channels(&self) -> usize;

    /// Replaces the notifier, migrating every live registration onto the
    /// replacement. Funnels onto the loop thread when called elsewhere.
    fn rebuild_notifier(&self);
}

/// Per-loop tuning, resolved from the process config plus group
/// overrides at construction.
#[derive(Debug, Clone)]
pub(crate) struct LoopConfig {
    pub io_ratio: u8,
    pub rebuild_threshold: u32,
    pub disable_key_set_optimization: bool,
    pub max_pending_tasks: usize,
}

impl LoopConfig {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        LoopConfig {
            io_ratio: cfg.io_ratio,
            rebuild_threshold: cfg.selector_auto_rebuild_threshold,
            disable_key_set_optimization: cfg.disable_key_set_optimization,
            max_pending_tasks: cfg.default_max_pending_tasks,
        }
    }
}

/// Loop-thread-only state. Lives on the run loop's stack behind a
/// `RefCell`; tasks running on the loop reach it through the
/// thread-local set up by [`run_loop`].
struct Core {
    poll: Poll,
    events: Events,
    ready: ReadyKeys,
    registrations: Slab<Entry>,
    scheduled: BinaryHeap<Reverse<ScheduledEntry>>,
    next_seq: u64,
    cancelled_keys: u32,
    needs_select_again: bool,
    graceful_start: i64,
    last_execution: i64,
}

thread_local! {
    static CURRENT: Cell<Option<NonNull<RefCell<Core>>>> = const { Cell::new(None) };
}

/// Clears the thread-local core pointer when the run loop unwinds.
struct CurrentGuard;

impl CurrentGuard {
    fn set(core: &RefCell<Core>) -> CurrentGuard {
        CURRENT.with(|c| c.set(Some(NonNull::from(core))));
        CurrentGuard
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(None));
    }
}

/// Runs `f` against the calling loop's core. Fails when the caller is
/// not an event-loop thread.
fn with_core<R>(f: impl FnOnce(&RefCell<Core>) -> R) -> Result<R> {
    CURRENT.with(|c| match c.get() {
        // The pointer targets the run loop's stack frame and is cleared
        // before that frame is torn down, so it is valid here.
        Some(ptr) => Ok(f(unsafe { ptr.as_ref() })),
        None => Err(Error::IllegalState("not on an event loop thread")),
    })
}

/// Cross-thread loop state.
pub(crate) struct Shared {
    me: Weak<Shared>,
    id: u64,
    name: String,
    pub(crate) exec: ExecutorCore,
    /// Swapped on rebuild so producer wakeups target the live notifier.
    waker: RwLock<Arc<MioWaker>>,
    /// The core, parked here until the thread starts and takes it.
    pending: Mutex<Option<Core>>,
    thread_factory: Arc<dyn ThreadFactory>,
    io_ratio: AtomicU8,
    rebuild_threshold: u32,
    disable_key_set_opt: bool,
    channels: AtomicUsize,
    pub(crate) rebuilds: AtomicU64,
}

/// A single-threaded event loop. Cheap to clone; all clones address the
/// same loop.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    pub(crate) fn new(
        name: String,
        cfg: LoopConfig,
        thread_factory: Arc<dyn ThreadFactory>,
    ) -> Result<EventLoop> {
        static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(0);

        let poll = Poll::new().map_err(Error::from)?;
        let waker = MioWaker::new(poll.registry(), WAKER_TOKEN).map_err(Error::from)?;
        let core = Core {
            poll,
            events: Events::with_capacity(1024),
            ready: ReadyKeys::with_capacity(1024),
            registrations: Slab::new(),
            scheduled: BinaryHeap::new(),
            next_seq: 0,
            cancelled_keys: 0,
            needs_select_again: false,
            graceful_start: 0,
            last_execution: 0,
        };
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            name,
            exec: ExecutorCore::new(cfg.max_pending_tasks),
            waker: RwLock::new(Arc::new(waker)),
            pending: Mutex::new(Some(core)),
            thread_factory,
            io_ratio: AtomicU8::new(cfg.io_ratio),
            rebuild_threshold: cfg.rebuild_threshold,
            disable_key_set_opt: cfg.disable_key_set_optimization,
            channels: AtomicUsize::new(0),
            rebuilds: AtomicU64::new(0),
        });
        Ok(EventLoop { shared })
    }

    /// Identity of this loop, distinct within the process. Channels carry
    /// it so the dispatch loop can tell whether a stale entry still
    /// belongs here.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// A promise whose listeners notify on this loop's thread.
    pub fn new_promise<T: Send + 'static>(&self) -> Promise<T> {
        Promise::with_handle(self.shared.clone())
    }

    /// Share of each iteration spent on I/O dispatch, 1..=100.
    pub fn io_ratio(&self) -> u8 {
        self.shared.io_ratio.load(Ordering::Relaxed)
    }

    /// At 100 the balancing is off entirely: every pending task runs
    /// after each dispatch.
    pub fn set_io_ratio(&self, ratio: u8) -> Result<()> {
        if !(1..=100).contains(&ratio) {
            return Err(Error::InvalidArgument(format!(
                "io_ratio: {ratio} (expected: 1..=100)"
            )));
        }
        self.shared.io_ratio.store(ratio, Ordering::Relaxed);
        Ok(())
    }

    fn register_attachment(&self, attachment: Attachment, ops: Ops) -> Result<Registration> {
        if ops.is_empty() {
            return Err(Error::InvalidArgument(
                "interest ops must be non-zero".into(),
            ));
        }
        let valid = attachment.valid_ops();
        if !valid.contains(ops) {
            return Err(Error::InvalidArgument(format!(
                "invalid interest ops: {ops:?} (valid: {valid:?})"
            )));
        }
        if self.shared.exec.is_shutdown() {
            return Err(Error::IllegalState("event loop shut down"));
        }
        let shared = self.shared.clone();
        let token = self.call_on_loop(move || register0(&shared, attachment, ops))?;
        Ok(Registration {
            event_loop: self.clone(),
            token,
        })
    }

    pub(crate) fn set_interest_ops(&self, token: usize, ops: Ops) -> Result<()> {
        if ops.is_empty() {
            return Err(Error::InvalidArgument(
                "interest ops must be non-zero".into(),
            ));
        }
        self.call_on_loop(move || {
            with_core(|cell| {
                let mut c = cell.borrow_mut();
                let c = &mut *c;
                let entry = c
                    .registrations
                    .get_mut(token)
                    .filter(|e| !e.cancelled)
                    .ok_or(Error::IllegalState("registration is cancelled"))?;
                let attachment = entry
                    .attachment
                    .as_mut()
                    .ok_or(Error::IllegalState("registration is being dispatched"))?;
                let valid = attachment.valid_ops();
                if !valid.contains(ops) {
                    return Err(Error::InvalidArgument(format!(
                        "invalid interest ops: {ops:?} (valid: {valid:?})"
                    )));
                }
                attachment
                    .reregister(c.poll.registry(), Token(token), ops)
                    .map_err(Error::from)?;
                entry.interest = ops;
                Ok(())
            })?
        })
    }

    pub(crate) fn interest_ops(&self, token: usize) -> Result<Ops> {
        self.call_on_loop(move || {
            with_core(|cell| {
                cell.borrow()
                    .registrations
                    .get(token)
                    .filter(|e| !e.cancelled)
                    .map(|e| e.interest)
                    .ok_or(Error::IllegalState("registration is cancelled"))
            })?
        })
    }

    pub(crate) fn cancel_registration(&self, token: usize) -> Result<()> {
        let shared = self.shared.clone();
        self.call_on_loop(move || {
            with_core(|cell| {
                let mut c = cell.borrow_mut();
                let c = &mut *c;
                let Some(entry) = c.registrations.get_mut(token) else {
                    return Ok(());
                };
                if entry.cancelled {
                    return Ok(());
                }
                entry.cancelled = true;
                if let Some(att) = entry.attachment.as_mut() {
                    let _ = att.deregister(c.poll.registry());
                }
                note_cancel(c);
                shared.channel_removed();
                Ok(())
            })?
        })
    }

    /// Runs `f` synchronously on the loop thread: inline when already
    /// there, otherwise submitted and awaited.
    fn call_on_loop<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + Clone + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.in_event_loop() {
            return f();
        }
        let fut = self.submit(f);
        fut.sync()?;
        match fut.get_now() {
            Some(result) => result,
            None => Err(Error::IllegalState("loop task produced no result")),
        }
    }

}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.shared.name)
            .field("state", &self.shared.exec.state())
            .finish()
    }
}

impl Executor for EventLoop {
    fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.execute_runnable(Box::new(task), true)
    }

    fn submit<T, F>(&self, task: F) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let promise = self.new_promise::<T>();
        let p = promise.clone();
        let wrapped: Runnable = Box::new(move || {
            match catch_unwind(AssertUnwindSafe(task)) {
                Ok(value) => {
                    p.try_success(value);
                }
                Err(_) => {
                    p.try_failure(Error::EventLoop("submitted task panicked".into()));
                }
            }
        });
        if let Err(e) = self.shared.execute_runnable(wrapped, true) {
            promise.try_failure(e);
        }
        promise.future()
    }

    fn schedule<T, F>(&self, task: F, delay: Duration) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let promise = self.new_promise::<T>();
        let p = promise.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        promise.future().add_listener(move |f| {
            if f.is_cancelled() {
                flag.store(true, Ordering::Release);
            }
        });
        let deadline = mono_nanos() + duration_nanos(delay);
        let run: Runnable = Box::new(move || {
            // A cancel that lands before this point wins; afterwards the
            // task is committed.
            if !p.set_uncancellable() {
                return;
            }
            match catch_unwind(AssertUnwindSafe(task)) {
                Ok(value) => {
                    p.try_success(value);
                }
                Err(_) => {
                    p.try_failure(Error::EventLoop("scheduled task panicked".into()));
                }
            }
        });
        let entry = ScheduledEntry {
            deadline,
            seq: 0,
            task: run,
            cancelled,
        };
        if self.in_event_loop() {
            let _ = with_core(|cell| push_scheduled(cell, entry));
        } else {
            // Wake only when the new deadline precedes whatever the loop
            // already armed; a later deadline is covered by the existing
            // wakeup and by the queue check before blocking.
            let immediate = deadline < self.shared.exec.wakeup_state.load(Ordering::Acquire);
            let insert: Runnable = Box::new(move || {
                let _ = with_core(|cell| push_scheduled(cell, entry));
            });
            if let Err(e) = self.shared.execute_runnable(insert, immediate) {
                promise.try_failure(e);
            }
        }
        promise.future()
    }

    fn in_event_loop(&self) -> bool {
        self.shared.exec.in_event_loop()
    }

    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Future<()> {
        if timeout < quiet_period {
            let p = Promise::<()>::new();
            p.try_failure(Error::InvalidArgument(
                "timeout must be at least the quiet period".into(),
            ));
            return p.future();
        }
        loop {
            let state = self.shared.exec.state();
            if state >= ST_SHUTTING_DOWN {
                break;
            }
            // The window must be visible before the state flips, or the
            // loop could read zeroes and exit early.
            self.shared.exec.record_shutdown_window(quiet_period, timeout);
            if self
                .shared
                .exec
                .state
                .compare_exchange(state, ST_SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if state == ST_NOT_STARTED {
                    // Never ran: bring the thread up so it can wind down.
                    if self.shared.spawn_loop_thread().is_err() {
                        self.shared.exec.advance_state(ST_TERMINATED);
                        self.shared.exec.termination.try_success(());
                        return self.termination_future();
                    }
                }
                // A no-op nudge keeps the loop from parking in the
                // notifier before it notices the state change.
                let _ = self.shared.exec.try_offer(Box::new(|| {}));
                if self.shared.exec.claim_wakeup() {
                    self.shared.wake_notifier();
                }
                break;
            }
        }
        self.termination_future()
    }

    fn termination_future(&self) -> Future<()> {
        self.shared.exec.termination_future()
    }

    fn is_shutting_down(&self) -> bool {
        self.shared.exec.is_shutting_down()
    }

    fn is_shutdown(&self) -> bool {
        self.shared.exec.is_shutdown()
    }

    fn is_terminated(&self) -> bool {
        self.shared.exec.is_terminated()
    }
}

impl Reactor for EventLoop {
    fn register<S>(&self, source: S, ops: Ops, task: Box<dyn ReadyTask>) -> Result<Registration>
    where
        S: Selectable + 'static,
    {
        self.register_attachment(
            Attachment::Task {
                source: Box::new(source),
                task,
            },
            ops,
        )
    }

    fn register_channel(&self, channel: Box<dyn ChannelIo>, ops: Ops) -> Result<Registration> {
        self.register_attachment(Attachment::Channel(channel), ops)
    }

    fn registered_channels(&self) -> usize {
        self.shared.channels.load(Ordering::Acquire)
    }

    fn rebuild_notifier(&self) {
        let shared = self.shared.clone();
        if self.in_event_loop() {
            let _ = with_core(|cell| rebuild_notifier0(&shared, cell));
        } else {
            let job: Runnable = Box::new(move || {
                let me = shared.clone();
                let _ = with_core(|cell| rebuild_notifier0(&me, cell));
            });
            if let Err(e) = self.shared.execute_runnable(job, true) {
                warn!(error = %e, "could not funnel a notifier rebuild onto the loop");
            }
        }
    }
}

impl Shared {
    fn execute_runnable(&self, task: Runnable, immediate: bool) -> Result<()> {
        self.start_thread()?;
        self.exec.offer(task)?;
        if immediate && !self.exec.in_event_loop() && self.exec.claim_wakeup() {
            self.wake_notifier();
        }
        Ok(())
    }

    fn start_thread(&self) -> Result<()> {
        if self.exec.state() == ST_NOT_STARTED
            && self
                .exec
                .state
                .compare_exchange(
                    ST_NOT_STARTED,
                    ST_STARTED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.spawn_loop_thread()?;
        }
        Ok(())
    }

    fn spawn_loop_thread(&self) -> Result<()> {
        let core = self
            .pending
            .lock()
            .take()
            .expect("event loop thread started twice");
        let shared = self.me.upgrade().expect("event loop state dropped");
        match self
            .thread_factory
            .spawn(self.name.clone(), Box::new(move || run_loop(shared, core)))
        {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                self.exec.advance_state(ST_TERMINATED);
                self.exec.termination.try_failure(err.clone());
                Err(err)
            }
        }
    }

    pub(crate) fn wake_notifier(&self) {
        let waker = self.waker.read().clone();
        if let Err(e) = waker.wake() {
            warn!(error = %e, name = %self.name, "notifier wakeup failed");
        }
    }

    fn channel_added(&self) {
        let n = self.channels.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!("gyre_registered_channels").set(n as f64);
    }

    fn channel_removed(&self) {
        let n = self.channels.fetch_sub(1, Ordering::AcqRel) - 1;
        gauge!("gyre_registered_channels").set(n as f64);
    }
}

impl NotifyHandle for Shared {
    fn is_executor_thread(&self) -> bool {
        self.exec.in_event_loop()
    }

    fn execute_notification(&self, job: Box<dyn FnOnce() + Send>) {
        if self.exec.is_shutdown() || self.start_thread().is_err() {
            crate::global::handle().execute_notification(job);
            return;
        }
        match self.exec.try_offer(job) {
            Ok(()) => {
                if !self.exec.in_event_loop() && self.exec.claim_wakeup() {
                    self.wake_notifier();
                }
            }
            // The loop went away between the check and the offer; the
            // listener still has to run somewhere, exactly once.
            Err(job) => crate::global::handle().execute_notification(job),
        }
    }
}

fn push_scheduled(cell: &RefCell<Core>, mut entry: ScheduledEntry) {
    let mut c = cell.borrow_mut();
    entry.seq = c.next_seq;
    c.next_seq += 1;
    c.scheduled.push(Reverse(entry));
}

fn note_cancel(c: &mut Core) {
    c.cancelled_keys += 1;
    if c.cancelled_keys >= CLEANUP_INTERVAL {
        c.cancelled_keys = 0;
        c.needs_select_again = true;
    }
}

fn register0(shared: &Arc<Shared>, mut attachment: Attachment, ops: Ops) -> Result<usize> {
    with_core(|cell| {
        let mut c = cell.borrow_mut();
        let c = &mut *c;
        let slot = c.registrations.vacant_entry();
        let token = slot.key();
        attachment
            .register(c.poll.registry(), Token(token), ops)
            .map_err(Error::from)?;
        slot.insert(Entry {
            interest: ops,
            attachment: Some(attachment),
            cancelled: false,
        });
        shared.channel_added();
        Ok(token)
    })?
}

/// The loop body. Owns the core for the lifetime of the thread.
fn run_loop(shared: Arc<Shared>, core: Core) {
    shared
        .exec
        .thread_id
        .set(thread::current().id())
        .expect("event loop thread started twice");
    debug!(name = %shared.name, "event loop started");

    let core_cell = RefCell::new(core);
    let guard = CurrentGuard::set(&core_cell);

    // Termination below must run no matter how the body exits; waiters
    // on the termination future would otherwise hang forever.
    let body = catch_unwind(AssertUnwindSafe(|| run_loop_body(&shared, &core_cell)));
    if let Err(panic) = body {
        error!(?panic, name = %shared.name, "event loop body panicked");
    }

    shared.exec.advance_state(ST_SHUTDOWN);
    drop(guard);
    // Dropping the core closes the notifier.
    drop(core_cell.into_inner());
    shared.exec.advance_state(ST_TERMINATED);
    shared.exec.termination.try_success(());
    debug!(name = %shared.name, "event loop terminated");
}

fn run_loop_body(shared: &Arc<Shared>, core_cell: &RefCell<Core>) {
    let mut select_cnt: u32 = 0;

    loop {
        let strategy = match compute_strategy(shared, core_cell) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                // An interrupted wait is not a spin; reset and move on.
                debug!(name = %shared.name, "notifier wait interrupted");
                select_cnt = 0;
                continue;
            }
            Err(e) => {
                // The notifier itself is broken. Rebuild and back off so
                // a persistent failure cannot saturate the CPU.
                rebuild_notifier0(shared, core_cell);
                select_cnt = 0;
                handle_loop_error(&Error::from(e));
                continue;
            }
        };

        select_cnt += 1;
        {
            let mut c = core_cell.borrow_mut();
            c.cancelled_keys = 0;
            c.needs_select_again = false;
        }

        let io_ratio = shared.io_ratio.load(Ordering::Relaxed).clamp(1, 100) as i64;
        let ran_tasks;
        if io_ratio == 100 {
            if strategy > 0 {
                process_ready(shared, core_cell);
            }
            ran_tasks = run_all_tasks(shared, core_cell);
        } else if strategy > 0 {
            let io_start = Instant::now();
            process_ready(shared, core_cell);
            let io_nanos = io_start.elapsed().as_nanos() as i64;
            ran_tasks = run_tasks_for(shared, core_cell, io_nanos * (100 - io_ratio) / io_ratio);
        } else {
            // Nothing was dispatched; run the minimum batch so timers
            // cannot starve.
            ran_tasks = run_tasks_for(shared, core_cell, 0);
        }

        if ran_tasks || strategy > 0 {
            if select_cnt > MIN_PREMATURE_RETURNS {
                debug!(
                    name = %shared.name,
                    premature = select_cnt - 1,
                    "notifier returned prematurely several times in a row"
                );
            }
            select_cnt = 0;
        } else if unexpected_wakeup(shared, core_cell, select_cnt) {
            select_cnt = 0;
        }

        if shared.exec.is_shutting_down() {
            close_all(shared, core_cell);
            if confirm_shutdown(shared, core_cell) {
                return;
            }
        }
    }
}

/// Steps 1 and 2 of the iteration: pick a strategy, and when it is
/// `SELECT`, arm the wakeup word and wait on the notifier bounded by the
/// earliest timer deadline. Returns the number of ready entries.
fn compute_strategy(shared: &Arc<Shared>, cell: &RefCell<Core>) -> io::Result<i64> {
    if shared.exec.has_tasks() {
        // Work is pending: poll without blocking and use the count.
        return poll_ready(shared, cell, Some(Duration::ZERO)).map(|n| n as i64);
    }

    let deadline = next_scheduled_deadline(cell).unwrap_or(NONE);
    let _ = shared.exec.wakeup_state.compare_exchange(
        AWAKE,
        deadline,
        Ordering::AcqRel,
        Ordering::Relaxed,
    );
    let polled = if shared.exec.has_tasks() {
        // A task slipped in while arming; skip the wait entirely.
        Ok(strategy::SELECT)
    } else {
        select_until(shared, cell, deadline).map(|n| n as i64)
    };
    // Racy-lazy restore: an extra producer wakeup after this write is
    // harmless, a missed one is prevented by the producer-side swap.
    shared.exec.wakeup_state.store(AWAKE, Ordering::Relaxed);
    polled
}

fn next_scheduled_deadline(cell: &RefCell<Core>) -> Option<i64> {
    let c = cell.borrow();
    c.scheduled.peek().map(|Reverse(e)| e.deadline)
}

fn select_until(shared: &Arc<Shared>, cell: &RefCell<Core>, deadline: i64) -> io::Result<usize> {
    let timeout = if deadline == NONE {
        if shared.exec.is_shutting_down() {
            // Winding down: never park unbounded, the quiet-period check
            // has to keep running.
            Some(Duration::from_millis(100))
        } else {
            None
        }
    } else {
        let delta = deadline - mono_nanos();
        Some(Duration::from_nanos(delta.max(0) as u64))
    };
    poll_ready(shared, cell, timeout)
}

/// One notifier wait plus the refill of the ready view. The wakeup
/// token never reaches dispatch and never counts towards the strategy.
fn poll_ready(
    shared: &Arc<Shared>,
    cell: &RefCell<Core>,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let mut c = cell.borrow_mut();
    let c = &mut *c;
    c.poll.poll(&mut c.events, timeout)?;
    if shared.disable_key_set_opt {
        let count = c
            .events
            .iter()
            .filter(|e| e.token() != WAKER_TOKEN)
            .count();
        return Ok(count);
    }
    c.ready.reset(0);
    for event in c.events.iter() {
        if event.token() == WAKER_TOKEN {
            continue;
        }
        c.ready.push(ReadyKey {
            token: event.token(),
            ready: Ops::from_event(event),
        });
    }
    Ok(c.ready.len())
}

fn process_ready(shared: &Arc<Shared>, cell: &RefCell<Core>) {
    if shared.disable_key_set_opt {
        process_ready_plain(shared, cell);
    } else {
        process_ready_optimized(shared, cell);
    }
}

/// Indexed walk over the dense ready array, nulling each slot before its
/// dispatch. Crossing the cancel threshold mid-walk truncates the tail,
/// flushes stale entries with a non-blocking poll, and restarts.
fn process_ready_optimized(shared: &Arc<Shared>, cell: &RefCell<Core>) {
    let mut i = 0;
    loop {
        let key = { cell.borrow_mut().ready.take(i) };
        let Some(key) = key else { break };
        dispatch_key(shared, cell, key.token, key.ready);
        if cell.borrow().needs_select_again {
            {
                cell.borrow_mut().ready.reset(i + 1);
            }
            select_again(shared, cell);
            i = 0;
            continue;
        }
        i += 1;
    }
}

/// Fallback when the dense view is disabled: dispatch straight off the
/// notifier's event list, collecting a fresh snapshot per pass.
fn process_ready_plain(shared: &Arc<Shared>, cell: &RefCell<Core>) {
    let mut keys = snapshot_events(cell);
    let mut i = 0;
    while i < keys.len() {
        let (token, ready) = keys[i];
        dispatch_key(shared, cell, token, ready);
        i += 1;
        if cell.borrow().needs_select_again {
            select_again(shared, cell);
            keys = snapshot_events(cell);
            i = 0;
        }
    }
}

fn snapshot_events(cell: &RefCell<Core>) -> Vec<(Token, Ops)> {
    cell.borrow()
        .events
        .iter()
        .filter(|e| e.token() != WAKER_TOKEN)
        .map(|e| (e.token(), Ops::from_event(e)))
        .collect()
}

/// Flushes cancelled registrations and re-polls without blocking so the
/// notifier's internal state catches up before the next wait.
fn select_again(shared: &Arc<Shared>, cell: &RefCell<Core>) {
    {
        cell.borrow_mut().needs_select_again = false;
    }
    purge_cancelled(cell);
    if let Err(e) = poll_ready(shared, cell, Some(Duration::ZERO)) {
        warn!(error = %e, name = %shared.name, "failed to refresh the ready set");
    }
}

/// Drops cancelled entries, firing the unregistered hook for readiness
/// tasks exactly once.
fn purge_cancelled(cell: &RefCell<Core>) {
    let stale: Vec<Entry> = {
        let mut c = cell.borrow_mut();
        let tokens: Vec<usize> = c
            .registrations
            .iter()
            .filter(|(_, e)| e.cancelled)
            .map(|(t, _)| t)
            .collect();
        tokens
            .into_iter()
            .map(|t| c.registrations.remove(t))
            .collect()
    };
    for entry in stale {
        if let Some(Attachment::Task {
            mut source,
            mut task,
        }) = entry.attachment
        {
            task.channel_unregistered(&mut *source, None);
        }
    }
}

fn dispatch_key(shared: &Arc<Shared>, cell: &RefCell<Core>, token: Token, raw_ready: Ops) {
    counter!("gyre_ready_keys_dispatched_total").increment(1);

    enum Checked {
        Missing,
        Stale(Option<Attachment>),
        Live(Attachment, Ops),
    }

    let checked = {
        let mut c = cell.borrow_mut();
        match c.registrations.get_mut(token.0) {
            None => Checked::Missing,
            Some(e) if e.cancelled => Checked::Stale(e.attachment.take()),
            Some(e) => match e.attachment.take() {
                Some(a) => Checked::Live(a, e.interest),
                None => Checked::Missing,
            },
        }
    };

    match checked {
        Checked::Missing => {}
        Checked::Stale(attachment) => {
            // Cancelled earlier in this batch. A channel may have merely
            // moved loops as part of deregistration; close it only when
            // it still claims this one.
            let mut unreg = None;
            match attachment {
                Some(Attachment::Channel(mut ch)) => {
                    if ch.loop_id() == Some(shared.id) {
                        ch.close();
                    }
                }
                Some(Attachment::Task { source, task }) => unreg = Some((source, task)),
                None => {}
            }
            {
                let mut c = cell.borrow_mut();
                if c.registrations.contains(token.0) {
                    c.registrations.remove(token.0);
                }
            }
            if let Some((mut source, mut task)) = unreg {
                task.channel_unregistered(&mut *source, None);
            }
        }
        Checked::Live(attachment, interest) => match attachment {
            Attachment::Channel(ch) => {
                dispatch_channel(shared, cell, token, ch, interest, raw_ready)
            }
            Attachment::Task { source, task } => {
                dispatch_task(shared, cell, token, source, task, interest, raw_ready)
            }
        },
    }
}

/// Drives one internal channel: finish-connect first (with the connect
/// bit cleared from interest so the notifier cannot spin on it), then
/// flush, then read/accept, the last also for zero-ready entries as a
/// defense against notifiers that report nothing for a selected entry.
fn dispatch_channel(
    shared: &Arc<Shared>,
    cell: &RefCell<Core>,
    token: Token,
    mut ch: Box<dyn ChannelIo>,
    interest: Ops,
    raw_ready: Ops,
) {
    let ready = raw_ready & interest;
    let mut failed = false;

    if ready.contains(Ops::CONNECT) {
        let trimmed = interest.without(Ops::CONNECT);
        {
            let mut c = cell.borrow_mut();
            let c = &mut *c;
            if let Some(entry) = c.registrations.get_mut(token.0) {
                entry.interest = trimmed;
            }
            match trimmed.to_interest() {
                Some(interest) => {
                    if let Err(e) = ch.reregister(c.poll.registry(), token, interest) {
                        warn!(error = %e, "failed to clear connect interest");
                    }
                }
                None => {
                    let _ = ch.deregister(c.poll.registry());
                }
            }
        }
        if let Err(e) = ch.finish_connect() {
            warn!(error = %e, "finish_connect failed, closing the channel");
            ch.close();
            failed = true;
        }
    }

    // Flush before reading: drained write buffers free memory for the
    // reads that follow.
    if !failed && ready.contains(Ops::WRITE) {
        ch.force_flush();
    }

    if !failed && (ready.intersects(Ops::READ.or(Ops::ACCEPT)) || ready.is_empty()) {
        if let Err(e) = ch.read_ready() {
            warn!(error = %e, "channel read failed, closing the channel");
            ch.close();
            failed = true;
        }
    }

    let mut c = cell.borrow_mut();
    let c = &mut *c;
    if failed || !ch.is_open() {
        if c.registrations.contains(token.0) {
            c.registrations.remove(token.0);
            let _ = ch.deregister(c.poll.registry());
            note_cancel(c);
            shared.channel_removed();
        }
    } else if let Some(entry) = c.registrations.get_mut(token.0) {
        if entry.cancelled {
            // The channel cancelled itself mid-dispatch.
            let _ = ch.deregister(c.poll.registry());
            c.registrations.remove(token.0);
        } else {
            entry.attachment = Some(Attachment::Channel(ch));
        }
    }
}

fn dispatch_task(
    shared: &Arc<Shared>,
    cell: &RefCell<Core>,
    token: Token,
    mut source: Box<dyn Selectable>,
    mut task: Box<dyn ReadyTask>,
    interest: Ops,
    raw_ready: Ops,
) {
    let ready = raw_ready & interest;
    let mut new_interest = None;
    let mut cancel_requested = false;
    let outcome = {
        let mut ctx = ReadyContext {
            ready,
            interest,
            new_interest: &mut new_interest,
            cancelled: &mut cancel_requested,
        };
        catch_unwind(AssertUnwindSafe(|| task.channel_ready(&mut *source, &mut ctx)))
            .unwrap_or_else(|_| Err(Error::EventLoop("readiness task panicked".into())))
    };

    match outcome {
        Ok(()) if !cancel_requested => {
            let removed = {
                let mut c = cell.borrow_mut();
                let c = &mut *c;
                match c.registrations.get_mut(token.0) {
                    Some(entry) if !entry.cancelled => {
                        if let Some(ops) = new_interest {
                            if source.valid_ops().contains(ops) {
                                match source_reregister(&mut source, c.poll.registry(), token, ops) {
                                    Ok(()) => entry.interest = ops,
                                    Err(e) => {
                                        warn!(error = %e, "interest change failed")
                                    }
                                }
                            } else {
                                warn!(ops = ?ops, "interest change outside the resource's valid ops");
                            }
                        }
                        entry.attachment = Some(Attachment::Task { source, task });
                        None
                    }
                    _ => {
                        // Cancelled underneath the callback.
                        let _ = source.deregister(c.poll.registry());
                        if c.registrations.contains(token.0) {
                            c.registrations.remove(token.0);
                        }
                        Some((source, task))
                    }
                }
            };
            if let Some((mut source, mut task)) = removed {
                task.channel_unregistered(&mut *source, None);
            }
        }
        Ok(()) => {
            remove_task_entry(shared, cell, token, &mut source);
            task.channel_unregistered(&mut *source, None);
        }
        Err(cause) => {
            warn!(error = %cause, "readiness task failed, cancelling its registration");
            remove_task_entry(shared, cell, token, &mut source);
            task.channel_unregistered(&mut *source, Some(&cause));
        }
    }
}

fn source_reregister(
    source: &mut Box<dyn Selectable>,
    registry: &mio::Registry,
    token: Token,
    ops: Ops,
) -> io::Result<()> {
    let interest = ops
        .to_interest()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty interest"))?;
    source.reregister(registry, token, interest)
}

fn remove_task_entry(
    shared: &Arc<Shared>,
    cell: &RefCell<Core>,
    token: Token,
    source: &mut Box<dyn Selectable>,
) {
    let mut c = cell.borrow_mut();
    let c = &mut *c;
    let _ = source.deregister(c.poll.registry());
    if c.registrations.contains(token.0) {
        let entry = c.registrations.remove(token.0);
        if !entry.cancelled {
            note_cancel(c);
            shared.channel_removed();
        }
    }
}

/// Moves due timer entries onto the task queue; a full bounded queue
/// pushes the head back and stops.
fn fetch_from_scheduled(shared: &Arc<Shared>, cell: &RefCell<Core>) {
    loop {
        let entry = {
            let mut c = cell.borrow_mut();
            let now = mono_nanos();
            match c.scheduled.peek() {
                Some(Reverse(e)) if e.deadline <= now => c.scheduled.pop().map(|Reverse(e)| e),
                _ => None,
            }
        };
        let Some(entry) = entry else { break };
        if entry.cancelled.load(Ordering::Acquire) {
            continue;
        }
        let ScheduledEntry {
            deadline,
            seq,
            task,
            cancelled,
        } = entry;
        if let Err(task) = shared.exec.try_offer(task) {
            cell.borrow_mut().scheduled.push(Reverse(ScheduledEntry {
                deadline,
                seq,
                task,
                cancelled,
            }));
            break;
        }
    }
}

/// Drains tasks under a wall-time budget, checking the clock once per
/// batch of 64. A zero budget still runs one batch so a dispatch-less
/// iteration cannot starve queued work.
fn run_tasks_for(shared: &Arc<Shared>, cell: &RefCell<Core>, timeout_nanos: i64) -> bool {
    fetch_from_scheduled(shared, cell);
    let Some(first) = shared.exec.queue.poll() else {
        return false;
    };
    let deadline = if timeout_nanos > 0 {
        mono_nanos() + timeout_nanos
    } else {
        0
    };
    let mut task = first;
    let mut ran: u64 = 0;
    loop {
        safe_execute(task);
        ran += 1;
        if ran % 64 == 0 && mono_nanos() >= deadline {
            break;
        }
        match shared.exec.queue.poll() {
            Some(next) => task = next,
            None => break,
        }
    }
    counter!("gyre_tasks_executed_total").increment(ran);
    cell.borrow_mut().last_execution = mono_nanos();
    true
}

/// Unbounded drain used at `io_ratio == 100` and during shutdown: runs
/// until neither the queue nor the due timers produce anything.
fn run_all_tasks(shared: &Arc<Shared>, cell: &RefCell<Core>) -> bool {
    let mut ran: u64 = 0;
    loop {
        fetch_from_scheduled(shared, cell);
        let mut progressed = false;
        while let Some(task) = shared.exec.queue.poll() {
            safe_execute(task);
            progressed = true;
            ran += 1;
        }
        if !progressed {
            break;
        }
    }
    if ran > 0 {
        counter!("gyre_tasks_executed_total").increment(ran);
        cell.borrow_mut().last_execution = mono_nanos();
        true
    } else {
        false
    }
}

fn safe_execute(task: Runnable) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
        error!(?panic, "a task raised an unexpected panic");
    }
}

/// Step 5: a wait that produced neither dispatch nor tasks. Past the
/// threshold the notifier is assumed to be spinning and gets rebuilt.
fn unexpected_wakeup(shared: &Arc<Shared>, cell: &RefCell<Core>, select_cnt: u32) -> bool {
    if shared.rebuild_threshold > 0 && select_cnt >= shared.rebuild_threshold {
        warn!(
            name = %shared.name,
            count = select_cnt,
            "notifier returned prematurely too many times in a row, rebuilding it"
        );
        rebuild_notifier0(shared, cell);
        return true;
    }
    false
}

fn handle_loop_error(e: &Error) {
    warn!(error = %e, "unexpected failure in the event loop");
    // Back off so consecutive immediate failures cannot saturate a core.
    thread::sleep(Duration::from_secs(1));
}

/// Opens a fresh notifier, migrates every live registration onto it
/// preserving token, interest, and attachment, swaps the producer-facing
/// waker, and closes the old notifier. Per-entry failures close the
/// affected registration; the rebuild itself never aborts.
fn rebuild_notifier0(shared: &Arc<Shared>, cell: &RefCell<Core>) {
    let new_poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failed to open a replacement notifier");
            return;
        }
    };
    let new_waker = match MioWaker::new(new_poll.registry(), WAKER_TOKEN) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "failed to arm the replacement notifier");
            return;
        }
    };

    let mut failed: Vec<usize> = Vec::new();
    let mut migrated = 0usize;
    {
        let mut c = cell.borrow_mut();
        let c = &mut *c;
        for (token, entry) in c.registrations.iter_mut() {
            if entry.cancelled {
                continue;
            }
            let Some(attachment) = entry.attachment.as_mut() else {
                continue;
            };
            if let Err(e) = attachment.deregister(c.poll.registry()) {
                trace!(error = %e, token, "old notifier refused deregistration");
            }
            match attachment.register(new_poll.registry(), Token(token), entry.interest) {
                Ok(()) => migrated += 1,
                Err(e) => {
                    warn!(error = %e, token, "failed to move a registration to the new notifier");
                    failed.push(token);
                }
            }
        }
        // Dropping the old poll closes it; everything live is already on
        // the replacement.
        c.poll = new_poll;
        c.events.clear();
        c.ready.reset(0);
    }
    *shared.waker.write() = Arc::new(new_waker);

    let cause = Error::EventLoop("registration did not survive a notifier rebuild".into());
    for token in failed {
        let entry = { cell.borrow_mut().registrations.try_remove(token) };
        let Some(entry) = entry else { continue };
        shared.channel_removed();
        match entry.attachment {
            Some(Attachment::Channel(mut ch)) => ch.close(),
            Some(Attachment::Task {
                mut source,
                mut task,
            }) => task.channel_unregistered(&mut *source, Some(&cause)),
            None => {}
        }
    }

    shared.rebuilds.fetch_add(1, Ordering::Release);
    counter!("gyre_selector_rebuilds_total").increment(1);
    info!(name = %shared.name, migrated, "migrated registrations to a new notifier");
}

/// Shutdown step: unregister and close everything still on the table.
fn close_all(shared: &Arc<Shared>, cell: &RefCell<Core>) {
    let entries: Vec<Entry> = {
        let mut c = cell.borrow_mut();
        let tokens: Vec<usize> = c.registrations.iter().map(|(t, _)| t).collect();
        tokens
            .into_iter()
            .map(|t| c.registrations.remove(t))
            .collect()
    };
    for entry in entries {
        if !entry.cancelled {
            shared.channel_removed();
        }
        match entry.attachment {
            Some(Attachment::Channel(mut ch)) => ch.close(),
            Some(Attachment::Task {
                mut source,
                mut task,
            }) => task.channel_unregistered(&mut *source, None),
            None => {}
        }
    }
}

/// True once the loop may exit: all tasks drained, the quiet period has
/// lapsed since the last execution, or the hard timeout is up.
fn confirm_shutdown(shared: &Arc<Shared>, cell: &RefCell<Core>) -> bool {
    {
        let mut c = cell.borrow_mut();
        // Timers never fire once shutdown begins.
        c.scheduled.clear();
        if c.graceful_start == 0 {
            c.graceful_start = mono_nanos();
        }
    }
    if run_all_tasks(shared, cell) {
        // Work arrived during the quiet period; the clock restarts.
        return shared.exec.quiet_period_ns.load(Ordering::Acquire) == 0;
    }
    let now = mono_nanos();
    let started = cell.borrow().graceful_start;
    if now - started > shared.exec.shutdown_timeout_ns.load(Ordering::Acquire) {
        return true;
    }
    let last = cell.borrow().last_execution;
    if now - last <= shared.exec.quiet_period_ns.load(Ordering::Acquire) {
        // Not quiet yet; check again shortly rather than spinning.
        thread::sleep(Duration::from_millis(100));
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::DefaultThreadFactory;
    use std::io::{Read, Write};
    use std::sync::mpsc;

    fn loop_config(rebuild_threshold: u32) -> LoopConfig {
        LoopConfig {
            io_ratio: 50,
            rebuild_threshold,
            disable_key_set_optimization: false,
            max_pending_tasks: usize::MAX,
        }
    }

    fn new_loop(name: &str, cfg: LoopConfig) -> EventLoop {
        EventLoop::new(name.into(), cfg, Arc::new(DefaultThreadFactory)).expect("failed to build a loop")
    }

    struct NoopTask;

    impl ReadyTask for NoopTask {
        fn channel_ready(
            &mut self,
            _source: &mut dyn Selectable,
            _ctx: &mut ReadyContext<'_>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn spin_storm_rebuilds_the_notifier_and_registrations_survive() {
        let lp = new_loop("gyre-test-spin", loop_config(3));
        let listener =
            mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).expect("bind failed");
        let reg = lp
            .register(listener, Ops::ACCEPT, Box::new(NoopTask))
            .expect("register failed");
        assert_eq!(lp.registered_channels(), 1);

        // Raw notifier wakes bypass the producer-side CAS, so the loop
        // sees every one of them as a premature return.
        for _ in 0..100 {
            lp.shared.wake_notifier();
            thread::sleep(Duration::from_millis(2));
            if lp.shared.rebuilds.load(Ordering::Acquire) > 0 {
                break;
            }
        }

        assert!(lp.shared.rebuilds.load(Ordering::Acquire) >= 1);
        assert_eq!(lp.registered_channels(), 1);
        assert_eq!(reg.interest_ops().expect("interest lookup"), Ops::ACCEPT);

        lp.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .sync()
            .expect("shutdown failed");
    }

    #[test]
    fn no_wakeup_is_issued_while_the_loop_is_awake() {
        let lp = new_loop("gyre-test-awake", loop_config(512));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        lp.execute(move || {
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
        .expect("execute failed");
        entered_rx.recv().expect("loop never started the task");

        // The loop is mid-task, so its wakeup word is AWAKE; none of
        // these submissions may touch the notifier.
        let before = lp.shared.exec.wakeups_issued.load(Ordering::Relaxed);
        for _ in 0..5 {
            lp.execute(|| {}).expect("execute failed");
        }
        let after = lp.shared.exec.wakeups_issued.load(Ordering::Relaxed);
        assert_eq!(before, after);

        release_tx.send(()).unwrap();
        lp.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .sync()
            .expect("shutdown failed");
    }

    struct TestChannel {
        stream: mio::net::TcpStream,
        steps: Arc<Mutex<Vec<&'static str>>>,
        owner: u64,
        open: bool,
    }

    impl registration::SourceIo for TestChannel {
        fn register(
            &mut self,
            registry: &mio::Registry,
            token: Token,
            interest: mio::Interest,
        ) -> io::Result<()> {
            registry.register(&mut self.stream, token, interest)
        }

        fn reregister(
            &mut self,
            registry: &mio::Registry,
            token: Token,
            interest: mio::Interest,
        ) -> io::Result<()> {
            registry.reregister(&mut self.stream, token, interest)
        }

        fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
            registry.deregister(&mut self.stream)
        }

        fn valid_ops(&self) -> Ops {
            Ops::READ.or(Ops::WRITE).or(Ops::CONNECT)
        }
    }

    impl ChannelIo for TestChannel {
        fn finish_connect(&mut self) -> io::Result<()> {
            self.steps.lock().push("connect");
            Ok(())
        }

        fn force_flush(&mut self) {
            self.steps.lock().push("flush");
        }

        fn read_ready(&mut self) -> io::Result<()> {
            let mut buf = [0u8; 256];
            loop {
                match self.stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => self.steps.lock().push("read"),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }

        fn loop_id(&self) -> Option<u64> {
            Some(self.owner)
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn close(&mut self) {
            self.open = false;
            self.steps.lock().push("closed");
        }
    }

    #[test]
    fn channel_dispatch_finishes_connect_before_reading() {
        let server = std::net::TcpListener::bind("127.0.0.1:0").expect("bind failed");
        let addr = server.local_addr().expect("no local addr");
        let acceptor = thread::spawn(move || {
            let (mut peer, _) = server.accept().expect("accept failed");
            peer.write_all(b"hi").expect("write failed");
            thread::sleep(Duration::from_millis(500));
        });

        let lp = new_loop("gyre-test-channel", loop_config(512));
        let steps = Arc::new(Mutex::new(Vec::new()));
        let stream = mio::net::TcpStream::connect(addr).expect("connect failed");
        let channel = TestChannel {
            stream,
            steps: steps.clone(),
            owner: lp.id(),
            open: true,
        };
        let reg = lp
            .register_channel(Box::new(channel), Ops::CONNECT | Ops::READ)
            .expect("register failed");

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            {
                let seen = steps.lock();
                if seen.contains(&"connect") && seen.contains(&"read") {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "dispatch never happened: {:?}", steps.lock());
            thread::sleep(Duration::from_millis(5));
        }

        {
            let seen = steps.lock();
            let connect_at = seen.iter().position(|s| *s == "connect").unwrap();
            let read_at = seen.iter().position(|s| *s == "read").unwrap();
            assert!(connect_at < read_at, "order was {seen:?}");
        }
        // The connect bit is cleared from interest before finish_connect
        // runs, so the notifier cannot spin on writability.
        assert_eq!(reg.interest_ops().expect("interest lookup"), Ops::READ);

        acceptor.join().unwrap();
        lp.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .sync()
            .expect("shutdown failed");
    }

    struct AcceptSignal {
        tx: mpsc::Sender<()>,
    }

    impl ReadyTask for AcceptSignal {
        fn channel_ready(
            &mut self,
            source: &mut dyn Selectable,
            _ctx: &mut ReadyContext<'_>,
        ) -> Result<()> {
            let listener = source
                .as_any_mut()
                .downcast_mut::<mio::net::TcpListener>()
                .expect("not a listener");
            while listener.accept().is_ok() {
                self.tx.send(()).unwrap();
            }
            Ok(())
        }
    }

    #[test]
    fn back_to_back_rebuilds_leave_the_loop_functional() {
        let lp = new_loop("gyre-test-rebuild", loop_config(512));
        let listener =
            mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).expect("bind failed");
        let addr = listener.local_addr().expect("no local addr");
        let (tx, rx) = mpsc::channel();
        lp.register(listener, Ops::ACCEPT, Box::new(AcceptSignal { tx }))
            .expect("register failed");

        lp.rebuild_notifier();
        lp.rebuild_notifier();
        let deadline = Instant::now() + Duration::from_secs(2);
        while lp.shared.rebuilds.load(Ordering::Acquire) < 2 {
            assert!(Instant::now() < deadline, "rebuilds never ran");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(lp.registered_channels(), 1);

        // The twice-rebuilt notifier behaves exactly like the original.
        let _client = std::net::TcpStream::connect(addr).expect("connect failed");
        rx.recv_timeout(Duration::from_secs(2))
            .expect("no delivery after rebuilds");

        lp.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .sync()
            .expect("shutdown failed");
    }

    #[test]
    fn plain_dispatch_path_still_delivers() {
        let mut cfg = loop_config(512);
        cfg.disable_key_set_optimization = true;
        let lp = new_loop("gyre-test-plain", cfg);

        let listener =
            mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).expect("bind failed");
        let addr = listener.local_addr().expect("no local addr");
        let (tx, rx) = mpsc::channel();
        lp.register(listener, Ops::ACCEPT, Box::new(AcceptSignal { tx }))
            .expect("register failed");
        let _client = std::net::TcpStream::connect(addr).expect("connect failed");
        rx.recv_timeout(Duration::from_secs(2))
            .expect("acceptance never reached the readiness task");

        lp.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .sync()
            .expect("shutdown failed");
    }
}
