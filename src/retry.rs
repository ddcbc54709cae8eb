//! Back-off functions and retry policies.
//!
//! Metadata refresh, producer retries, consumer fetch retries and group
//! rebalance retries all pause between attempts through a [`Backoff`]. The
//! producer pipeline asks for single delays with [`Backoff::delay`]; request
//! loops wrap a [`RetryPolicy`] with `backon`:
//!
//! ```rust,no_run
//! use backon::Retryable;
//! use gregor::retry::{Backoff, RetryPolicy};
//! use std::time::Duration;
//!
//! async fn example() -> gregor::Result<()> {
//!     let policy = RetryPolicy::new(Backoff::Constant(Duration::from_millis(250)), 3);
//!     (|| async { Ok::<_, gregor::Error>(()) })
//!         .retry(policy)
//!         .when(|e| e.is_retriable())
//!         .await
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

/// Computes the pause before the next attempt from `(retries so far, max retries)`.
pub type BackoffFn = Arc<dyn Fn(u32, u32) -> Duration + Send + Sync>;

#[derive(Clone)]
pub enum Backoff {
    /// The same pause before every attempt.
    Constant(Duration),
    /// `initial * factor^retries`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f32,
    },
    Custom(BackoffFn),
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Constant(d) => f.debug_tuple("Constant").field(d).finish(),
            Backoff::Exponential {
                initial,
                max,
                factor,
            } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("max", max)
                .field("factor", factor)
                .finish(),
            Backoff::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Backoff {
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Backoff::Exponential {
            initial,
            max,
            factor: 2.0,
        }
    }

    pub fn custom(f: impl Fn(u32, u32) -> Duration + Send + Sync + 'static) -> Self {
        Backoff::Custom(Arc::new(f))
    }

    /// Pause before retry number `retries + 1` out of `max`.
    pub fn delay(&self, retries: u32, max: u32) -> Duration {
        match self {
            Backoff::Constant(d) => *d,
            Backoff::Exponential {
                initial,
                max: cap,
                factor,
            } => exponential_builder(*initial, *cap, *factor, retries as usize + 1)
                .build()
                .nth(retries as usize)
                .unwrap_or(*cap),
            Backoff::Custom(f) => f(retries, max),
        }
    }
}

fn exponential_builder(initial: Duration, max: Duration, factor: f32, times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(initial)
        .with_max_delay(max)
        .with_factor(factor)
        .with_max_times(times)
}

/// A [`Backoff`] bounded to `max_retries` attempts, usable with
/// `backon::Retryable`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(backoff: Backoff, max_retries: u32) -> Self {
        Self {
            backoff,
            max_retries,
        }
    }
}

impl BackoffBuilder for RetryPolicy {
    type Backoff = RetryDelays;

    fn build(self) -> Self::Backoff {
        match self.backoff {
            Backoff::Exponential {
                initial,
                max,
                factor,
            } => RetryDelays::Exponential(
                exponential_builder(initial, max, factor, self.max_retries as usize).build(),
            ),
            backoff => RetryDelays::Stepped {
                backoff,
                retries: 0,
                max: self.max_retries,
            },
        }
    }
}

/// Iterator of pauses produced by a [`RetryPolicy`].
pub enum RetryDelays {
    Exponential(ExponentialBackoff),
    Stepped { backoff: Backoff, retries: u32, max: u32 },
}

impl Iterator for RetryDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        match self {
            RetryDelays::Exponential(inner) => inner.next(),
            RetryDelays::Stepped {
                backoff,
                retries,
                max,
            } => {
                if *retries >= *max {
                    return None;
                }
                let delay = backoff.delay(*retries, *max);
                *retries += 1;
                Some(delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::Retryable;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_constant_delay() {
        let backoff = Backoff::Constant(Duration::from_millis(100));
        assert_eq!(backoff.delay(0, 3), Duration::from_millis(100));
        assert_eq!(backoff.delay(2, 3), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let backoff = Backoff::exponential(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(backoff.delay(0, 5), Duration::from_millis(10));
        assert_eq!(backoff.delay(1, 5), Duration::from_millis(20));
        assert_eq!(backoff.delay(2, 5), Duration::from_millis(40));
        assert_eq!(backoff.delay(3, 5), Duration::from_millis(50));
    }

    #[test]
    fn test_custom_delay_sees_retry_counts() {
        let backoff = Backoff::custom(|retries, max| Duration::from_millis((max - retries) as u64));
        assert_eq!(backoff.delay(1, 4), Duration::from_millis(3));
    }

    #[test]
    fn test_policy_yields_max_retries() {
        let policy = RetryPolicy::new(Backoff::Constant(Duration::from_millis(1)), 3);
        assert_eq!(policy.build().count(), 3);

        let policy = RetryPolicy::new(
            Backoff::exponential(Duration::from_millis(1), Duration::from_millis(8)),
            4,
        );
        assert_eq!(policy.build().count(), 4);
    }

    #[tokio::test]
    async fn test_policy_with_backon_retry() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(Backoff::Constant(Duration::from_millis(1)), 5);
        let result = (|| async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(crate::Error::RequestTimeout)
            } else {
                Ok(7)
            }
        })
        .retry(policy)
        .when(|e: &crate::Error| e.is_retriable())
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retriable_error_stops_immediately() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(Backoff::Constant(Duration::from_millis(1)), 5);
        let result: crate::Result<()> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(crate::Error::Config("bad".to_string()))
        })
        .retry(policy)
        .when(|e: &crate::Error| e.is_retriable())
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
