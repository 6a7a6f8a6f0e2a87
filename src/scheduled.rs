//! Deadline-ordered tasks for the loop's timer heap.
//!
//! Deadlines are nanoseconds on a process-wide monotonic clock anchored
//! at first use. Entries order by deadline, ties broken by submission
//! sequence, so equal deadlines run in submission order. Cancellation is
//! a flag checked when the entry surfaces; a late cancel after the pop is
//! a no-op.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::executor::Runnable;

/// Armed-wakeup sentinel: the loop is awake.
pub(crate) const AWAKE: i64 = -1;
/// Armed-wakeup sentinel: waiting with nothing on the calendar.
pub(crate) const NONE: i64 = i64::MAX;

/// Nanoseconds since the process anchor.
pub(crate) fn mono_nanos() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as i64
}

pub(crate) struct ScheduledEntry {
    pub deadline: i64,
    pub seq: u64,
    pub task: Runnable,
    /// Set by a cancellation listener on the entry's future.
    pub cancelled: Arc<AtomicBool>,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}
