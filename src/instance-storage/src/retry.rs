// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

/// The result of one attempt of a retried operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// The operation succeeded.
    Ok(T),
    /// The operation failed, but may succeed if attempted again.
    RetryableErr(E),
    /// The operation failed and must not be attempted again.
    FatalErr(E),
}

/// A retried operation was cancelled before it succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Configures a retry operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Retry {
    /// The initial backoff for the exponential backoff retries.
    pub initial_backoff: Duration,
    /// The backoff multiplier.
    pub multiplier: u32,
    /// Clamps the maximum backoff for the retry operation.
    pub clamp_backoff: Duration,
    /// A seed for the random jitter.
    pub seed: u64,
}

impl Retry {
    /// The retry configuration used when claiming an instance id.
    ///
    /// Uses the given SystemTime to initialize the seed for random jitter.
    pub fn instance_defaults(now: SystemTime) -> Self {
        Retry {
            initial_backoff: Duration::from_millis(50),
            multiplier: 2,
            clamp_backoff: Duration::from_millis(200),
            seed: now
                .duration_since(UNIX_EPOCH)
                .map_or(0, |x| u64::from(x.subsec_nanos())),
        }
    }

    /// Convert into [`RetryStream`]
    pub fn into_retry_stream(self) -> RetryStream {
        let rng = SmallRng::seed_from_u64(self.seed);
        let backoff = self.initial_backoff;
        RetryStream {
            cfg: self,
            rng,
            attempt: 0,
            backoff,
        }
    }

    /// Retries `f` until it returns [`RetryResult::Ok`] or
    /// [`RetryResult::FatalErr`], or until `cancel` fires.
    ///
    /// `f` receives the number of the attempt, starting at zero. An attempt
    /// in flight when `cancel` fires is dropped.
    pub async fn retry_async_cancelable<F, U, T, E>(
        self,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, E>
    where
        F: FnMut(usize) -> U,
        U: Future<Output = RetryResult<T, E>>,
        E: From<Cancelled>,
    {
        let mut retry = self.into_retry_stream();
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            let res = tokio::select! {
                res = f(retry.attempt()) => res,
                () = cancel.cancelled() => return Err(Cancelled.into()),
            };
            match res {
                RetryResult::Ok(t) => return Ok(t),
                RetryResult::FatalErr(e) => return Err(e),
                RetryResult::RetryableErr(_) => {}
            }
            retry = tokio::select! {
                retry = retry.sleep() => retry,
                () = cancel.cancelled() => return Err(Cancelled.into()),
            };
        }
    }
}

/// A series of exponential, jittered, clamped sleeps.
#[derive(Debug)]
pub struct RetryStream {
    cfg: Retry,
    rng: SmallRng,
    attempt: usize,
    backoff: Duration,
}

impl RetryStream {
    /// How many times [Self::sleep] has been called.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// The next sleep (without jitter for easy printing in logs).
    pub fn next_sleep(&self) -> Duration {
        self.backoff
    }

    /// Executes the next sleep in the series.
    ///
    /// This isn't cancel-safe, so it consumes and returns self, to prevent
    /// accidental mis-use.
    pub async fn sleep(mut self) -> Self {
        let jitter = self.rng.gen_range(0.9..=1.1);
        let sleep = self.next_sleep().mul_f64(jitter);
        tokio::time::sleep(sleep).await;
        self.advance()
    }

    fn advance(mut self) -> Self {
        self.attempt += 1;
        self.backoff = std::cmp::min(self.backoff * self.cfg.multiplier, self.cfg.clamp_backoff);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Fatal,
        Retryable,
        Cancelled,
    }

    impl From<Cancelled> for TestError {
        fn from(_: Cancelled) -> Self {
            TestError::Cancelled
        }
    }

    fn test_retry() -> Retry {
        Retry {
            seed: 0,
            ..Retry::instance_defaults(UNIX_EPOCH)
        }
    }

    #[test]
    fn retry_stream() {
        let mut r = test_retry().into_retry_stream();
        for expected_sleep_ms in [50, 100, 200, 200, 200] {
            assert_eq!(r.next_sleep(), Duration::from_millis(expected_sleep_ms));
            r = r.advance();
        }
        assert_eq!(r.attempt(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_ok() {
        let cancel = CancellationToken::new();
        let res: Result<usize, TestError> = test_retry()
            .retry_async_cancelable(&cancel, |attempt| async move {
                if attempt < 3 {
                    RetryResult::RetryableErr(TestError::Retryable)
                } else {
                    RetryResult::Ok(attempt)
                }
            })
            .await;
        assert_eq!(res, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_stop() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let res: Result<(), TestError> = test_retry()
            .retry_async_cancelable(&cancel, |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    RetryResult::FatalErr(TestError::Fatal)
                }
            })
            .await;
        assert_eq!(res, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<(), TestError> = test_retry()
            .retry_async_cancelable(&cancel, |_| async { RetryResult::Ok(()) })
            .await;
        assert_eq!(res, Err(TestError::Cancelled));

        // Cancelling while backing off ends the loop.
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let res: Result<(), TestError> = test_retry()
            .retry_async_cancelable(&cancel, |attempt| {
                if attempt == 2 {
                    canceller.cancel();
                }
                async { RetryResult::RetryableErr(TestError::Retryable) }
            })
            .await;
        assert_eq!(res, Err(TestError::Cancelled));
    }
}
