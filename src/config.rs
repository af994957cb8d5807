//! Engine configuration.
//!
//! Parsed from environment variables with fallback defaults, in the same way for
//! every entry point (CLI and library callers using `from_env`).

use std::time::Duration;

/// Retry policy for transient store contention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (default 5).
    pub attempts: u32,
    /// Lower bound of the randomized backoff (default 200ms).
    pub min_backoff: Duration,
    /// Upper bound of the randomized backoff (default 400ms).
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(400),
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping. Meant for tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

/// Configuration shared by the materializer and the consistency passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Depth budget for nested activities and in-reply-to chains (default 20).
    pub max_depth: usize,
    /// Hop cap for conversation id cascades (default 1000).
    pub cascade_limit: usize,
    pub retry: RetryPolicy,
    /// A note that was never loaded accepts content regardless of timestamps (default true).
    pub first_load_overrides: bool,
    /// Actor merges keep the record registered as a local account (default true).
    pub merge_prefers_account: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 20,
            cascade_limit: 1000,
            retry: RetryPolicy::default(),
            first_load_overrides: true,
            merge_prefers_account: true,
        }
    }
}

impl EngineConfig {
    /// Parses configuration from environment variables.
    ///
    /// Falls back to defaults when env vars are not set or invalid.
    ///
    /// # Environment Variables
    ///
    /// - `WEAVE_MAX_DEPTH` (usize, default 20)
    /// - `WEAVE_CASCADE_LIMIT` (usize, default 1000)
    /// - `WEAVE_RETRY_ATTEMPTS` (u32, default 5)
    /// - `WEAVE_RETRY_MIN_MS` / `WEAVE_RETRY_MAX_MS` (u64, default 200 / 400)
    /// - `WEAVE_FIRST_LOAD_OVERRIDES` (bool, default true)
    /// - `WEAVE_MERGE_PREFERS_ACCOUNT` (bool, default true)
    ///
    /// # Examples
    ///
    /// ```
    /// use weave::EngineConfig;
    ///
    /// let config = EngineConfig::from_env();
    /// assert!(config.max_depth > 0);
    /// ```
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let min_ms = env_parse("WEAVE_RETRY_MIN_MS").unwrap_or(200u64);
        let max_ms = env_parse("WEAVE_RETRY_MAX_MS")
            .unwrap_or(400u64)
            .max(min_ms);

        Self {
            max_depth: env_parse("WEAVE_MAX_DEPTH").unwrap_or(defaults.max_depth),
            cascade_limit: env_parse("WEAVE_CASCADE_LIMIT").unwrap_or(defaults.cascade_limit),
            retry: RetryPolicy {
                attempts: env_parse("WEAVE_RETRY_ATTEMPTS")
                    .unwrap_or(defaults.retry.attempts)
                    .max(1),
                min_backoff: Duration::from_millis(min_ms),
                max_backoff: Duration::from_millis(max_ms),
            },
            first_load_overrides: env_parse("WEAVE_FIRST_LOAD_OVERRIDES")
                .unwrap_or(defaults.first_load_overrides),
            merge_prefers_account: env_parse("WEAVE_MERGE_PREFERS_ACCOUNT")
                .unwrap_or(defaults.merge_prefers_account),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
