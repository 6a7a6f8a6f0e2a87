//! Process-wide tuning knobs, read once at startup.
//!
//! Every knob can be overridden per group at construction time; the
//! environment only seeds the defaults. Nothing here is consulted again
//! after the first read.

use std::env;
use std::sync::OnceLock;

/// Keys cancelled before the notifier's stale entries are flushed with a
/// non-blocking poll.
pub const CLEANUP_INTERVAL: u32 = 256;

/// Below this many consecutive premature notifier returns, rebuild never
/// triggers.
pub const MIN_PREMATURE_RETURNS: u32 = 3;

const DEFAULT_REBUILD_THRESHOLD: u32 = 512;
const DEFAULT_IO_RATIO: u8 = 50;

#[derive(Debug, Clone)]
pub struct Config {
    /// Dispatch straight off the notifier's own event list instead of the
    /// dense ready-key array.
    pub disable_key_set_optimization: bool,
    /// Consecutive spurious notifier returns before the notifier is
    /// rebuilt. Zero disables rebuilding entirely.
    pub selector_auto_rebuild_threshold: u32,
    /// Share of each iteration spent on I/O dispatch, 1..=100.
    pub io_ratio: u8,
    /// Capacity bound for per-loop task queues. `usize::MAX` means
    /// effectively unlimited.
    pub default_max_pending_tasks: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            disable_key_set_optimization: false,
            selector_auto_rebuild_threshold: DEFAULT_REBUILD_THRESHOLD,
            io_ratio: DEFAULT_IO_RATIO,
            default_max_pending_tasks: usize::MAX,
        }
    }
}

impl Config {
    /// Reads the process environment into a config, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = read_env::<u8>("GYRE_NO_KEY_SET_OPTIMIZATION") {
            cfg.disable_key_set_optimization = v != 0;
        }
        if let Some(v) = read_env::<u32>("GYRE_SELECTOR_AUTO_REBUILD_THRESHOLD") {
            // Values under the floor disable rebuilding rather than arming
            // a hair trigger.
            cfg.selector_auto_rebuild_threshold = if v < MIN_PREMATURE_RETURNS { 0 } else { v };
        }
        if let Some(v) = read_env::<u8>("GYRE_IO_RATIO") {
            if (1..=100).contains(&v) {
                cfg.io_ratio = v;
            }
        }
        if let Some(v) = read_env::<usize>("GYRE_MAX_PENDING_TASKS") {
            cfg.default_max_pending_tasks = v;
        }
        cfg
    }

    /// The shared process-wide instance.
    pub fn global() -> &'static Config {
        static GLOBAL: OnceLock<Config> = OnceLock::new();
        GLOBAL.get_or_init(Config::from_env)
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok()?.parse().ok()
}
