use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of push attempts.
pub const DEFAULT_PUSH_ATTEMPTS: u32 = 3;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoverConfig {
    /// Push retry policy
    pub retry: RetryPolicy,

    /// Directory holding cached image layers, keyed by digest
    pub cache_dir: PathBuf,

    /// Allow plain-HTTP registries
    pub insecure: bool,
}

impl Default for MoverConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            cache_dir: std::env::temp_dir().join("relok-layer-cache"),
            insecure: false,
        }
    }
}

impl MoverConfig {
    /// Build a configuration from defaults overlaid with environment variables.
    ///
    /// Reads `RELOK_RETRIES`, `RELOK_RETRY_BACKOFF_MS`, `RELOK_CACHE_DIR` and
    /// `RELOK_INSECURE`. Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(attempts) = env_parse::<u32>("RELOK_RETRIES") {
            config.retry.attempts = attempts;
        }
        if let Some(backoff) = env_parse::<u64>("RELOK_RETRY_BACKOFF_MS") {
            config.retry.backoff_ms = backoff;
        }
        if let Ok(dir) = std::env::var("RELOK_CACHE_DIR") {
            if !dir.is_empty() {
                config.cache_dir = PathBuf::from(dir);
            }
        }
        if let Some(insecure) = env_parse::<bool>("RELOK_INSECURE") {
            config.insecure = insecure;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment value");
            None
        }
    }
}

/// Retry policy for registry pushes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,

    /// Base delay between attempts in milliseconds; grows linearly
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_PUSH_ATTEMPTS,
            backoff_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt count and no delay.
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts,
            backoff_ms: 0,
        }
    }

    /// Attempts to make, never less than one.
    pub fn effective_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt as u64))
    }
}
