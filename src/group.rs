//! A fixed fleet of event loops behind a round-robin chooser.
//!
//! The group creates its loops once at construction and never resizes.
//! `next()` hands out loops in chooser order; callers then pin channels
//! to whichever loop they got. Shutting the group down propagates to
//! every child with one shared quiet period, and the aggregate
//! termination future completes when the last child terminates.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use metrics::gauge;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::promise::{Future, Promise};
use crate::reactor::{EventLoop, LoopConfig};

/// Spawns the one thread each loop owns. Implementations may pin, name,
/// or prioritize however they like.
pub trait ThreadFactory: Send + Sync {
    fn spawn(&self, name: String, body: Box<dyn FnOnce() + Send>) -> io::Result<()>;
}

/// Plain named `std::thread` spawning.
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn spawn(&self, name: String, body: Box<dyn FnOnce() + Send>) -> io::Result<()> {
        thread::Builder::new().name(name).spawn(body)?;
        Ok(())
    }
}

/// Picks the next loop index for a submission.
pub trait Chooser: Send + Sync {
    fn next(&self) -> usize;
}

pub trait ChooserFactory: Send + Sync {
    fn new_chooser(&self, len: usize) -> Box<dyn Chooser>;
}

/// Round-robin, masking instead of dividing when the fleet size is a
/// power of two.
pub struct DefaultChooserFactory;

impl ChooserFactory for DefaultChooserFactory {
    fn new_chooser(&self, len: usize) -> Box<dyn Chooser> {
        if len.is_power_of_two() {
            Box::new(PowerOfTwoChooser {
                idx: AtomicUsize::new(0),
                mask: len - 1,
            })
        } else {
            Box::new(RoundRobinChooser {
                idx: AtomicUsize::new(0),
                len,
            })
        }
    }
}

struct PowerOfTwoChooser {
    idx: AtomicUsize,
    mask: usize,
}

impl Chooser for PowerOfTwoChooser {
    fn next(&self) -> usize {
        self.idx.fetch_add(1, Ordering::Relaxed) & self.mask
    }
}

struct RoundRobinChooser {
    idx: AtomicUsize,
    len: usize,
}

impl Chooser for RoundRobinChooser {
    fn next(&self) -> usize {
        self.idx.fetch_add(1, Ordering::Relaxed) % self.len
    }
}

/// Construction-time overrides; anything unset falls back to the
/// process-wide [`Config`].
#[derive(Default)]
pub struct GroupConfig {
    pub thread_factory: Option<Arc<dyn ThreadFactory>>,
    pub chooser_factory: Option<Arc<dyn ChooserFactory>>,
    pub io_ratio: Option<u8>,
    pub selector_auto_rebuild_threshold: Option<u32>,
    pub disable_key_set_optimization: Option<bool>,
    pub max_pending_tasks: Option<usize>,
}

/// The loop fleet. Owns its children; dropping the group does not stop
/// them; shut down explicitly.
pub struct EventLoopGroup {
    children: Vec<EventLoop>,
    chooser: Box<dyn Chooser>,
    termination: Future<()>,
}

impl EventLoopGroup {
    pub fn new(threads: usize) -> Result<Self> {
        Self::with_config(threads, GroupConfig::default())
    }

    pub fn with_config(threads: usize, cfg: GroupConfig) -> Result<Self> {
        static NEXT_GROUP_ID: AtomicUsize = AtomicUsize::new(0);

        if threads == 0 {
            return Err(Error::InvalidArgument(
                "thread count must be at least 1".into(),
            ));
        }
        if let Some(ratio) = cfg.io_ratio {
            if !(1..=100).contains(&ratio) {
                return Err(Error::InvalidArgument(format!(
                    "io_ratio: {ratio} (expected: 1..=100)"
                )));
            }
        }

        let mut loop_cfg = LoopConfig::from_config(Config::global());
        if let Some(ratio) = cfg.io_ratio {
            loop_cfg.io_ratio = ratio;
        }
        if let Some(threshold) = cfg.selector_auto_rebuild_threshold {
            loop_cfg.rebuild_threshold = threshold;
        }
        if let Some(disable) = cfg.disable_key_set_optimization {
            loop_cfg.disable_key_set_optimization = disable;
        }
        if let Some(max) = cfg.max_pending_tasks {
            loop_cfg.max_pending_tasks = max;
        }
        let factory = cfg
            .thread_factory
            .unwrap_or_else(|| Arc::new(DefaultThreadFactory));
        let group_id = NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed);

        let mut children: Vec<EventLoop> = Vec::with_capacity(threads);
        for i in 0..threads {
            let name = format!("gyre-loop-{group_id}-{i}");
            match EventLoop::new(name, loop_cfg.clone(), factory.clone()) {
                Ok(child) => children.push(child),
                Err(e) => {
                    // Partial fleets never escape: stop and await what
                    // already exists before surfacing the failure.
                    for built in &children {
                        built.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
                    }
                    for built in &children {
                        let _ = built.termination_future().wait();
                    }
                    return Err(e);
                }
            }
        }

        let chooser = match &cfg.chooser_factory {
            Some(factory) => factory.new_chooser(threads),
            None => DefaultChooserFactory.new_chooser(threads),
        };

        let aggregate = Promise::<()>::new();
        let remaining = Arc::new(AtomicUsize::new(threads));
        for child in &children {
            let promise = aggregate.clone();
            let remaining = remaining.clone();
            child.termination_future().add_listener(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    promise.try_success(());
                }
            });
        }

        gauge!("gyre_event_loops").increment(threads as f64);

        Ok(EventLoopGroup {
            children,
            chooser,
            termination: aggregate.future(),
        })
    }

    /// The next loop in chooser order.
    pub fn next(&self) -> &EventLoop {
        &self.children[self.chooser.next()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventLoop> {
        self.children.iter()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Propagates to every child and returns the aggregate termination
    /// future, completed once all of them have terminated.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Future<()> {
        for child in &self.children {
            child.shutdown_gracefully(quiet_period, timeout);
        }
        self.termination.clone()
    }

    pub fn termination_future(&self) -> Future<()> {
        self.termination.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.children.iter().all(|c| c.is_shutting_down())
    }

    pub fn is_shutdown(&self) -> bool {
        self.children.iter().all(|c| c.is_shutdown())
    }

    pub fn is_terminated(&self) -> bool {
        self.children.iter().all(|c| c.is_terminated())
    }
}

impl std::fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("loops", &self.children.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threads_is_invalid() {
        assert!(matches!(
            EventLoopGroup::new(0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn power_of_two_chooser_masks() {
        let chooser = DefaultChooserFactory.new_chooser(4);
        let picks: Vec<usize> = (0..8).map(|_| chooser.next()).collect();
        assert_eq!(picks, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn odd_size_chooser_wraps() {
        let chooser = DefaultChooserFactory.new_chooser(3);
        let picks: Vec<usize> = (0..6).map(|_| chooser.next()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }
}
