//! Logging and tracing initialization for bkmon.
//!
//! Structured logging via the `tracing` ecosystem, with pretty console
//! output for operators and JSON output for log shipping.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per line instead of human-readable output.
    pub json: bool,
    /// Default to DEBUG for the `bkmon` target.
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the level derived from `verbose`. Returns an error if
/// a subscriber is already installed.
pub fn init(config: LogConfig) -> anyhow::Result<()> {
    let level = if config.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bkmon={}", level.as_str().to_lowercase())));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(fmt::layer().json().flatten_event(true).with_target(true))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().compact().with_target(false))
            .try_init()?;
    }

    Ok(())
}

/// Per-key rate limiter for log lines.
///
/// Progress events arrive several times per second per job; this keeps one
/// line per job per interval.
///
/// ```ignore
/// let throttle = LogThrottle::new(Duration::from_secs(5));
/// if throttle.should_log(&job_id) {
///     tracing::info!(%job_id, progress, "Backup progress");
/// }
/// ```
pub struct LogThrottle<K> {
    interval: Duration,
    last: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash + Clone> LogThrottle<K> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// True on the first call for `key` and whenever `interval` has passed since the last `true`.
    ///
    /// Keys whose interval has elapsed are dropped, so keys that stop
    /// logging do not accumulate.
    pub fn should_log(&self, key: &K) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match last.get(key) {
            Some(at) if now.duration_since(*at) < self.interval => false,
            _ => {
                last.retain(|_, at| now.duration_since(*at) < self.interval);
                last.insert(key.clone(), now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget `key` so its next line is logged immediately.
    pub fn reset(&self, key: &K) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_per_key_is_logged() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_log(&1));
        assert!(throttle.should_log(&2));
    }

    #[test]
    fn repeated_line_is_suppressed() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_log(&"job-7"));
        assert!(!throttle.should_log(&"job-7"));
    }

    #[test]
    fn reset_reopens_key() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_log(&7));
        throttle.reset(&7);
        assert!(throttle.should_log(&7));
    }

    #[test]
    fn expired_keys_are_dropped() {
        let throttle = LogThrottle::new(Duration::from_millis(20));
        assert!(throttle.should_log(&1));
        assert!(throttle.should_log(&2));
        assert_eq!(throttle.len(), 2);

        std::thread::sleep(Duration::from_millis(40));
        assert!(throttle.should_log(&3));
        assert_eq!(throttle.len(), 1);
    }

    #[test]
    fn zero_interval_never_blocks() {
        let throttle = LogThrottle::new(Duration::ZERO);
        assert!(throttle.should_log(&7));
        assert!(throttle.should_log(&7));
    }
}
