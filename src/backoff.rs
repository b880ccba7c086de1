//! Bounded retries with exponential delay around any fallible async operation.
//!
//! [`Backoff`] knows nothing about brokers or envelopes: the publisher uses it to ride out
//! transient connection failures, but any `FnMut(I) -> impl Future<Output = Result<bool, E>>`
//! can be driven by it.
//!
//! # Failure convention
//!
//! An attempt fails either by returning `Err(_)` or by returning `Ok(false)`.
//! Both are retried in the same way; observers see the difference through [`AttemptFailure`].
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::amqp::configuration::BackoffSettings;

/// Retry policy: up to `max_retries + 1` attempts, sleeping `base_delay * 2^attempt` after
/// each failed one.
///
/// The sleep is a `tokio` timer, so it suspends the calling task rather than the thread.
/// There is no cancellation hook: drop the future (e.g. via `tokio::time::timeout` or by
/// aborting the task) to give up early, keeping in mind that an attempt in flight may still
/// complete on the broker side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_delay: Duration,
    max_retries: u32,
}

/// Hooks fired over the lifecycle of a single [`Backoff::execute`] call.
///
/// Exactly one of `on_success` or `on_final_error` fires per call; `on_retry` fires once for
/// every failed attempt that is followed by another one.
pub trait BackoffObserver<E> {
    /// `attempt` is zero-based.
    fn on_success(&self, _attempt: u32) {}

    /// Called before sleeping for `delay` ahead of attempt `attempt + 1`.
    fn on_retry(&self, _attempt: u32, _failure: &AttemptFailure<E>, _delay: Duration) {}

    fn on_final_error(&self, _attempt: u32, _failure: &AttemptFailure<E>) {}
}

impl<E> BackoffObserver<E> for () {}

/// Why a single attempt did not succeed.
#[derive(Debug)]
pub enum AttemptFailure<E> {
    /// The operation returned an error.
    Error(E),
    /// The operation completed but reported `false`.
    Unsuccessful,
}

impl<E> AttemptFailure<E> {
    pub fn into_error(self) -> Option<E> {
        match self {
            Self::Error(e) => Some(e),
            Self::Unsuccessful => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(e) => write!(f, "{e}"),
            Self::Unsuccessful => write!(f, "the operation reported an unsuccessful outcome"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AttemptFailure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Error(e) => Some(e),
            Self::Unsuccessful => None,
        }
    }
}

/// All the attempts allowed by a [`Backoff`] policy failed.
#[derive(Debug)]
pub struct BackoffError<E> {
    /// How many times the operation was invoked.
    pub attempts: u32,
    /// The outcome of the last attempt.
    pub last_failure: AttemptFailure<E>,
}

impl<E: fmt::Display> fmt::Display for BackoffError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Backoff exhausted after {} attempts - last failure: {}",
            self.attempts, self.last_failure
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BackoffError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_failure)
    }
}

impl Backoff {
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
        }
    }

    pub fn from_settings(settings: &BackoffSettings) -> Self {
        Self::new(settings.base_delay(), settings.max_retries)
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The sleep that follows failed attempt `attempt`.
    ///
    /// Saturates instead of overflowing for absurdly large attempt numbers.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2_u32
            .checked_pow(attempt)
            .and_then(|multiplier| self.base_delay.checked_mul(multiplier))
            .unwrap_or(Duration::MAX)
    }

    /// Run `operation` against clones of `input` until it succeeds or the policy is exhausted.
    pub async fn execute<I, E, F, Fut>(
        &self,
        input: I,
        mut operation: F,
        observer: &impl BackoffObserver<E>,
    ) -> Result<(), BackoffError<E>>
    where
        I: Clone,
        F: FnMut(I) -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let mut attempt = 0;
        loop {
            let failure = match operation(input.clone()).await {
                Ok(true) => {
                    observer.on_success(attempt);
                    return Ok(());
                }
                Ok(false) => AttemptFailure::Unsuccessful,
                Err(e) => AttemptFailure::Error(e),
            };

            if attempt >= self.max_retries {
                observer.on_final_error(attempt, &failure);
                return Err(BackoffError {
                    attempts: attempt + 1,
                    last_failure: failure,
                });
            }

            let delay = self.delay_for(attempt);
            observer.on_retry(attempt, &failure, delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
