//! A callback-driven event-loop group multiplexing many sockets over a
//! small fleet of threads.
//!
//! Each loop owns one OS readiness notifier and one thread; registered
//! resources are pinned to their loop for life so all per-registration
//! state is mutated without locks. Work submitted from other threads
//! flows through a multi-producer/single-consumer queue with an O(1)
//! amortized wakeup protocol. Every asynchronous operation (submission,
//! scheduling, registration, shutdown) completes a listener-chained
//! future with identical semantics. It consists of:
//!
//! - [`group`]: the loop fleet and its round-robin chooser
//! - [`reactor`]: the per-loop notifier, registration table, and dispatch
//! - [`executor`]: submission, scheduling, and lifecycle
//! - [`promise`]: single-assignment futures with listener chains
//! - [`config`]: process-wide tuning knobs, read once
//!
//! ```ignore
//! use gyre::{EventLoopGroup, Executor};
//!
//! let group = EventLoopGroup::new(2)?;
//! group.next().execute(|| println!("runs on a loop thread"))?;
//! group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5)).sync()?;
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod group;
pub mod ops;
pub mod promise;
pub mod reactor;

mod global;
mod queue;
mod scheduled;

pub use config::Config;
pub use error::{Error, Result};
pub use executor::Executor;
pub use group::{
    Chooser, ChooserFactory, DefaultChooserFactory, DefaultThreadFactory, EventLoopGroup,
    GroupConfig, ThreadFactory,
};
pub use ops::Ops;
pub use promise::{Future, Listener, ListenerId, Promise};
pub use reactor::registration::{
    ChannelIo, ReadyContext, ReadyTask, Registration, Selectable, SourceIo,
};
pub use reactor::{EventLoop, Reactor};

// Registered resources are mio sources; callers need mio's types to
// implement their own.
pub use mio;
