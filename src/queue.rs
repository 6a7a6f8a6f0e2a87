//! The per-loop task queue: many producer threads, one consumer.
//!
//! Producers on any thread enqueue with a wait-free push; the loop thread
//! is the only consumer. The unbounded default backs onto a segmented
//! queue; a bounded capacity swaps in a fixed ring whose `offer` reports
//! exhaustion instead of growing.

use crossbeam_queue::{ArrayQueue, SegQueue};

pub(crate) enum TaskQueue<T> {
    Unbounded(SegQueue<T>),
    Bounded(ArrayQueue<T>),
}

impl<T> TaskQueue<T> {
    /// `usize::MAX` selects the effectively unlimited variant.
    pub fn with_capacity(max_pending: usize) -> Self {
        if max_pending == usize::MAX {
            TaskQueue::Unbounded(SegQueue::new())
        } else {
            TaskQueue::Bounded(ArrayQueue::new(max_pending.max(1)))
        }
    }

    /// Hands the item back when a bounded queue is full; never fails
    /// otherwise.
    pub fn offer(&self, item: T) -> Result<(), T> {
        match self {
            TaskQueue::Unbounded(q) => {
                q.push(item);
                Ok(())
            }
            TaskQueue::Bounded(q) => q.push(item),
        }
    }

    pub fn poll(&self) -> Option<T> {
        match self {
            TaskQueue::Unbounded(q) => q.pop(),
            TaskQueue::Bounded(q) => q.pop(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TaskQueue::Unbounded(q) => q.is_empty(),
            TaskQueue::Bounded(q) => q.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TaskQueue::Unbounded(q) => q.len(),
            TaskQueue::Bounded(q) => q.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_offer_reports_exhaustion() {
        let q = TaskQueue::with_capacity(2);
        assert!(q.offer(1).is_ok());
        assert!(q.offer(2).is_ok());
        assert_eq!(q.offer(3), Err(3));
        assert_eq!(q.poll(), Some(1));
        assert!(q.offer(3).is_ok());
    }

    #[test]
    fn unbounded_preserves_fifo() {
        let q = TaskQueue::with_capacity(usize::MAX);
        for i in 0..100 {
            assert!(q.offer(i).is_ok());
        }
        assert_eq!(q.len(), 100);
        for i in 0..100 {
            assert_eq!(q.poll(), Some(i));
        }
        assert!(q.is_empty());
    }
}
