//! Bounded retry for transient store contention.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::StoreError;
use crate::config::RetryPolicy;

/// Runs `f`, retrying while it fails with a busy/locked store.
///
/// Sleeps a random duration between the policy's bounds before each retry. Errors that
/// are not transient return immediately. When every attempt was busy the result is
/// [`StoreError::Busy`].
///
/// # Examples
///
/// ```
/// use weave::{RetryPolicy, retry_on_busy};
///
/// let value = retry_on_busy(&RetryPolicy::immediate(3), "answer", || Ok(42)).unwrap();
/// assert_eq!(value, 42);
/// ```
pub fn retry_on_busy<F, T>(policy: &RetryPolicy, what: &str, mut f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_busy() => {
                debug!(what, attempt, "store busy");
                if attempt < attempts {
                    thread::sleep(jitter(policy));
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::Busy { attempts })
}

fn jitter(policy: &RetryPolicy) -> Duration {
    if policy.max_backoff <= policy.min_backoff {
        return policy.min_backoff;
    }
    rand::thread_rng().gen_range(policy.min_backoff..=policy.max_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn returns_first_success() {
        let mut calls = 0;
        let result = retry_on_busy(&RetryPolicy::immediate(5), "test", || {
            calls += 1;
            if calls < 3 { Err(busy()) } else { Ok(calls) }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_configured_attempts() {
        let mut calls = 0;
        let result: Result<(), _> = retry_on_busy(&RetryPolicy::immediate(5), "test", || {
            calls += 1;
            Err(busy())
        });
        assert!(matches!(result, Err(StoreError::Busy { attempts: 5 })));
        assert_eq!(calls, 5);
    }

    #[test]
    fn does_not_retry_other_errors() {
        let mut calls = 0;
        let result: Result<(), _> = retry_on_busy(&RetryPolicy::immediate(5), "test", || {
            calls += 1;
            Err(StoreError::UnsupportedActivity("flag".into()))
        });
        assert!(matches!(result, Err(StoreError::UnsupportedActivity(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = jitter(&policy);
            assert!(d >= policy.min_backoff && d <= policy.max_backoff);
        }
    }
}
