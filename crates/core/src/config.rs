use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime knobs for one mirror pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Default per-listener full resync period; zero disables resync.
    pub resync: Duration,
    /// How often the resync timer asks listeners whether they are due.
    pub resync_check: Duration,
    pub watch_backoff_base: Duration,
    pub watch_backoff_max: Duration,
    /// Server-side timeout for each watch request.
    pub watch_timeout_secs: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            resync: Duration::ZERO,
            resync_check: Duration::from_millis(1000),
            watch_backoff_base: Duration::from_millis(800),
            watch_backoff_max: Duration::from_secs(30),
            watch_timeout_secs: 290,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> { std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()) }

impl MirrorConfig {
    /// Defaults overridden by `KMIRROR_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            resync: env_u64("KMIRROR_RESYNC_SECS").map(Duration::from_secs).unwrap_or(d.resync),
            resync_check: env_u64("KMIRROR_RESYNC_CHECK_MS").map(Duration::from_millis).unwrap_or(d.resync_check),
            watch_backoff_base: env_u64("KMIRROR_WATCH_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.watch_backoff_base),
            watch_backoff_max: env_u64("KMIRROR_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.watch_backoff_max),
            watch_timeout_secs: std::env::var("KMIRROR_WATCH_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(d.watch_timeout_secs),
        }
    }

    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.watch_backoff_base = base;
        self.watch_backoff_max = max;
        self
    }
}
