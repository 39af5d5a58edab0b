//! Retry classification and exponential backoff
//!
//! The request executor owns the attempt loop itself (it has to interleave pause
//! checks, cache updates and error logging between attempts); this module only
//! decides whether a failure is worth another attempt and how long to sleep first.
//!
//! # Example
//!
//! ```
//! use llm_batch::config::RetryConfig;
//! use llm_batch::retry::backoff_delay;
//! use std::time::Duration;
//!
//! let config = RetryConfig::default();
//! assert_eq!(backoff_delay(&config, 0), Duration::from_secs(1));
//! assert_eq!(backoff_delay(&config, 3), Duration::from_secs(8));
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, UpstreamError};
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, rate limits, server errors, dropped connections)
/// return `true`; anything that would fail the same way again returns `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for UpstreamError {
    fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Timeout(_)
            | UpstreamError::RateLimited { .. }
            | UpstreamError::Api { .. }
            | UpstreamError::Transport(_) => true,
            // A 2xx body we cannot parse will not parse on the next attempt either
            UpstreamError::InvalidResponse(_) => false,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Upstream(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Sleep before the attempt following 0-based attempt `attempt`
///
/// `backoff_unit * backoff_base^attempt`, jittered by up to +100% when enabled and
/// capped at `max_delay` when one is set. Strictly increasing in `attempt` for
/// `backoff_base > 1` while below the cap and without jitter.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let secs = config.backoff_unit.as_secs_f64() * config.backoff_base.powi(exponent);
    let mut delay = if secs.is_finite() {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::MAX
    };

    if config.jitter {
        delay = add_jitter(delay);
    }
    match config.max_delay {
        Some(max) => delay.min(max),
        None => delay,
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor)).unwrap_or(delay)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: f64) -> RetryConfig {
        RetryConfig {
            backoff_base: base,
            backoff_unit: Duration::from_millis(10),
            max_delay: None,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_is_base_to_the_attempt() {
        let config = config(2.0);
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(10));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(20));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(40));
        assert_eq!(backoff_delay(&config, 5), Duration::from_millis(320));
    }

    #[test]
    fn test_backoff_strictly_increasing_for_base_above_one() {
        for base in [1.5, 2.0, 3.0] {
            let config = config(base);
            for attempt in 0..10 {
                assert!(
                    backoff_delay(&config, attempt + 1) > backoff_delay(&config, attempt),
                    "base {base}: delay before attempt {} must exceed delay before {}",
                    attempt + 2,
                    attempt + 1
                );
            }
        }
    }

    #[test]
    fn test_backoff_base_one_is_constant() {
        let config = config(1.0);
        assert_eq!(backoff_delay(&config, 0), backoff_delay(&config, 7));
    }

    #[test]
    fn test_backoff_respects_cap() {
        let mut config = config(2.0);
        config.max_delay = Some(Duration::from_millis(50));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(40));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(50));
        assert_eq!(backoff_delay(&config, 30), Duration::from_millis(50));
    }

    #[test]
    fn test_backoff_huge_attempt_saturates() {
        let config = config(2.0);
        assert_eq!(backoff_delay(&config, 5000), Duration::MAX);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut config = config(2.0);
        config.jitter = true;
        for _ in 0..100 {
            let delay = backoff_delay(&config, 1);
            assert!(delay >= Duration::from_millis(20));
            assert!(delay <= Duration::from_millis(40));
        }
    }

    #[test]
    fn test_upstream_classification() {
        assert!(UpstreamError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(
            UpstreamError::RateLimited {
                message: String::new(),
                body: None
            }
            .is_retryable()
        );
        assert!(
            UpstreamError::Api {
                status: 500,
                message: String::new(),
                body: None
            }
            .is_retryable()
        );
        assert!(UpstreamError::Transport("reset".into()).is_retryable());
        assert!(!UpstreamError::InvalidResponse("garbage".into()).is_retryable());

        assert!(Error::Upstream(UpstreamError::Transport("reset".into())).is_retryable());
        assert!(!Error::NotFound("job 1".into()).is_retryable());
    }
}
