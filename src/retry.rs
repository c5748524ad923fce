//! Retry and write-then-verify combinators.
//!
//! Both combinators borrow an explicit context (`&mut C`) and hand it to the
//! operation on every attempt. Callers pass whatever the operation needs
//! exclusive access to (a codec plus its transport, a session link), so a
//! retried exchange never has to re-acquire a lock it already holds.
//!
//! # Example
//!
//! ```rust
//! use labbridge::retry::{with_retry, RetryPolicy};
//! use std::time::Duration;
//!
//! # async fn demo() -> labbridge::error::AppResult<()> {
//! let policy = RetryPolicy::new(5, Duration::from_millis(50));
//! let mut calls = 0u32;
//! let value = with_retry(&policy, &mut calls, |calls| {
//!     Box::pin(async move {
//!         *calls += 1;
//!         Ok(*calls * 10)
//!     })
//! })
//! .await?;
//! assert_eq!(value, 10);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, DeviceError};
use futures::future::BoxFuture;
use std::fmt::Display;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often and how patiently an operation is attempted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts, 100 ms apart.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// `max_attempts` tries in total, `backoff_delay` apart.
    pub const fn new(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_delay,
        }
    }

    /// A single attempt, no delay.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Modbus RTU and TCP exchanges.
    pub fn modbus() -> Self {
        Self::default()
    }

    /// Framed-protocol writes.
    pub const fn framed_write() -> Self {
        Self::new(5, Duration::from_millis(50))
    }

    /// Framed-protocol reads, which also absorb implausible values.
    pub const fn framed_read() -> Self {
        Self::new(12, Duration::from_millis(500))
    }

    /// Laser send-settle-verify cycles.
    pub const fn laser_command() -> Self {
        Self::new(3, Duration::from_secs(1))
    }

    /// Laser status queries.
    pub const fn laser_status() -> Self {
        Self::new(3, Duration::from_millis(500))
    }

    /// Alicat command and poll exchanges.
    pub const fn ascii() -> Self {
        Self::new(3, Duration::from_millis(100))
    }

    /// Alicat setpoint and gas changes, each confirmed by a fresh poll.
    pub const fn ascii_verify() -> Self {
        Self::new(3, Duration::from_millis(200))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Result of a successful [`with_verify`].
#[derive(Debug, Clone, PartialEq)]
pub struct Verified<V> {
    pub value: V,
    /// Attempt on which the predicate held, starting at 1.
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. The last error is returned on exhaustion.
pub async fn with_retry<C, T, F>(policy: &RetryPolicy, ctx: &mut C, mut op: F) -> AppResult<T>
where
    C: ?Sized,
    F: for<'a> FnMut(&'a mut C) -> BoxFuture<'a, AppResult<T>>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(ctx).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!(attempt, max_attempts = attempts, error = %err, "transient failure, retrying");
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Write, read back, test; repeat until `predicate` holds.
///
/// Each attempt runs the whole write-then-read cycle. Retryable errors from
/// either half consume an attempt; other errors abort at once. On exhaustion
/// the last attempt decides the result: a read-back that failed the predicate
/// becomes [`DeviceError::VerificationFailed`], a retryable error is
/// returned as is.
pub async fn with_verify<C, V, W, R, P>(
    policy: &RetryPolicy,
    ctx: &mut C,
    expected: impl Display,
    mut write: W,
    mut read: R,
    predicate: P,
) -> AppResult<Verified<V>>
where
    C: ?Sized,
    V: Display,
    W: for<'a> FnMut(&'a mut C) -> BoxFuture<'a, AppResult<()>>,
    R: for<'a> FnMut(&'a mut C) -> BoxFuture<'a, AppResult<V>>,
    P: Fn(&V) -> bool,
{
    let attempts = policy.attempts();
    let mut last = Outcome::Untried;

    for attempt in 1..=attempts {
        let outcome = match write(ctx).await {
            Ok(()) => read(ctx).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(value) if predicate(&value) => {
                return Ok(Verified {
                    value,
                    attempts: attempt,
                })
            }
            Ok(value) => {
                debug!(attempt, observed = %value, expected = %expected, "read-back mismatch");
                last = Outcome::Mismatch(value);
            }
            Err(err) if err.is_retryable() => {
                warn!(attempt, error = %err, "verify cycle failed");
                last = Outcome::Failed(err);
            }
            Err(err) => return Err(err),
        }
        if attempt < attempts {
            sleep(policy.backoff_delay).await;
        }
    }

    match last {
        Outcome::Mismatch(value) => Err(DeviceError::verification(expected, value)),
        Outcome::Failed(err) => Err(err),
        Outcome::Untried => Err(DeviceError::verification(expected, "nothing")),
    }
}

/// How the latest verify cycle ended.
enum Outcome<V> {
    Untried,
    Mismatch(V),
    Failed(DeviceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProtocolError, TransportError};
    use tracing_test::traced_test;

    fn timeout() -> DeviceError {
        TransportError::Timeout(Duration::from_millis(1)).into()
    }

    #[tokio::test]
    async fn always_failing_op_runs_exactly_max_attempts() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let mut calls = 0u32;
        let result: AppResult<()> = with_retry(&policy, &mut calls, |calls| {
            Box::pin(async move {
                *calls += 1;
                Err(timeout())
            })
        })
        .await;
        assert!(matches!(result, Err(DeviceError::Transport(TransportError::Timeout(_)))));
        assert_eq!(calls, 5);
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_secs(10));
        let mut calls = 0u32;
        let started = tokio::time::Instant::now();
        let result: AppResult<()> = with_retry(&policy, &mut calls, |calls| {
            Box::pin(async move {
                *calls += 1;
                Err(DeviceError::from(ProtocolError::DeviceNak))
            })
        })
        .await;
        assert_eq!(result, Err(ProtocolError::DeviceNak.into()));
        assert_eq!(calls, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn succeeds_once_the_transient_error_clears() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1));
        let mut calls = 0u32;
        let value = with_retry(&policy, &mut calls, |calls| {
            Box::pin(async move {
                *calls += 1;
                if *calls < 3 {
                    Err(timeout())
                } else {
                    Ok(*calls)
                }
            })
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[traced_test]
    #[tokio::test]
    async fn each_retry_is_logged() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut calls = 0u32;
        let result: AppResult<()> = with_retry(&policy, &mut calls, |calls| {
            Box::pin(async move {
                *calls += 1;
                Err(timeout())
            })
        })
        .await;
        assert!(result.is_err());
        assert!(logs_contain("transient failure, retrying"));
        assert!(logs_contain("attempt=2"));
        assert!(!logs_contain("attempt=3"));
    }

    struct Register {
        written: Option<i64>,
        reads: Vec<i64>,
        writes: u32,
    }

    #[tokio::test]
    async fn verify_succeeds_on_third_read_back() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut reg = Register {
            written: None,
            reads: vec![42, 40, 41],
            writes: 0,
        };
        let verified = with_verify(
            &policy,
            &mut reg,
            42,
            |reg| {
                Box::pin(async move {
                    reg.written = Some(42);
                    reg.writes += 1;
                    Ok(())
                })
            },
            |reg| Box::pin(async move { Ok(reg.reads.pop().unwrap_or_default()) }),
            |value| *value == 42,
        )
        .await
        .unwrap();
        assert_eq!(verified, Verified { value: 42, attempts: 3 });
        assert_eq!(reg.writes, 3);
        assert_eq!(reg.written, Some(42));
    }

    #[tokio::test]
    async fn verify_reports_last_observed_value() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let mut reads = vec![7i64, 5];
        let err = with_verify(
            &policy,
            &mut reads,
            "9",
            |_| Box::pin(async { Ok(()) }),
            |reads| Box::pin(async move { Ok(reads.pop().unwrap_or_default()) }),
            |value| *value == 9,
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            DeviceError::VerificationFailed {
                expected: "9".into(),
                observed: "7".into()
            }
        );
    }

    #[tokio::test]
    async fn verify_reports_the_latest_failure() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut cycle = 0u32;
        let err = with_verify(
            &policy,
            &mut cycle,
            "9",
            |cycle| {
                Box::pin(async move {
                    *cycle += 1;
                    Ok(())
                })
            },
            |cycle| {
                Box::pin(async move {
                    if *cycle == 1 {
                        Ok(7i64)
                    } else {
                        Err(timeout())
                    }
                })
            },
            |value| *value == 9,
        )
        .await
        .unwrap_err();
        assert_eq!(err, timeout());
        assert_eq!(cycle, 3);

        // And the other way round: a timeout followed by a stale read-back.
        let mut cycle = 0u32;
        let err = with_verify(
            &policy,
            &mut cycle,
            "9",
            |cycle| {
                Box::pin(async move {
                    *cycle += 1;
                    Ok(())
                })
            },
            |cycle| {
                Box::pin(async move {
                    if *cycle < 3 {
                        Err(timeout())
                    } else {
                        Ok(7i64)
                    }
                })
            },
            |value| *value == 9,
        )
        .await
        .unwrap_err();
        assert_eq!(err, DeviceError::verification("9", 7));
    }

    #[tokio::test]
    async fn verify_propagates_hard_errors() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut unit = ();
        let err = with_verify(
            &policy,
            &mut unit,
            1,
            |_| Box::pin(async { Err(DeviceError::from(TransportError::Closed)) }),
            |_| Box::pin(async { Ok(1i64) }),
            |_| true,
        )
        .await
        .unwrap_err();
        assert_eq!(err, DeviceError::Transport(TransportError::Closed));
    }
}
