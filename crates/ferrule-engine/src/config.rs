//! Bridge configuration

use std::time::Duration;

/// Environment variable overriding [`BridgeOptions::worker_threads`]
pub const ENV_WORKER_THREADS: &str = "FERRULE_WORKER_THREADS";

/// Environment variable overriding [`BridgeOptions::loop_poll_interval`], in milliseconds
pub const ENV_LOOP_POLL_MS: &str = "FERRULE_LOOP_POLL_MS";

/// Options for creating an [`Env`](crate::Env)
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Number of worker pool threads running async work execute steps
    pub worker_threads: usize,

    /// How long the run loop waits for a re-entry job before re-checking
    /// its keep-alive count
    pub loop_poll_interval: Duration,

    /// Prefix for worker thread names
    pub thread_name_prefix: String,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().clamp(1, 8),
            loop_poll_interval: Duration::from_millis(10),
            thread_name_prefix: "ferrule".to_string(),
        }
    }
}

impl BridgeOptions {
    /// Defaults overlaid with `FERRULE_*` environment variables.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Set the worker pool size (at least one thread)
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    /// Set the run loop poll interval
    pub fn loop_poll_interval(mut self, interval: Duration) -> Self {
        self.loop_poll_interval = interval;
        self
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ENV_WORKER_THREADS) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.worker_threads = n,
                _ => log::warn!(
                    "ignoring {}={:?}: expected a positive integer",
                    ENV_WORKER_THREADS,
                    raw
                ),
            }
        }
        if let Some(raw) = lookup(ENV_LOOP_POLL_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.loop_poll_interval = Duration::from_millis(ms),
                _ => log::warn!("ignoring {}={:?}: expected milliseconds", ENV_LOOP_POLL_MS, raw),
            }
        }
        self
    }
}
