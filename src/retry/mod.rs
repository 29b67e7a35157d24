//! Delay-based retry for asynchronous operations.
//!
//! A failed attempt resolves to exactly one of: a retry after a delay, a
//! pass-through of a non-retriable error, or [`RetryError::Exhausted`] once
//! more than `max_attempts` retries happened.

pub mod builder;
pub mod delay;
pub mod error;
pub mod filter;
pub mod handler;
pub mod scheduler;
pub mod when;

pub use builder::RetryBuilder;
pub use delay::{Delay, TimeUnit};
pub use error::RetryError;
pub use filter::{ErrorMatcher, RetryFilter};
pub use handler::{MAX_ATTEMPTS_LIMIT, OnRetry, RetryDecision, RetryWithDelayHandler};
pub use scheduler::{RetryScheduler, TokioScheduler};
pub use when::RetryWhen;

use futures::stream::{self, Stream, StreamExt};
use std::future::Future;

/// Entry points for wrapping an operation with retries.
pub struct Retry;

impl Retry {
    /// 1 ms fixed delay.
    pub const DEFAULT_DELAY: Delay = Delay::fixed(1, TimeUnit::Milliseconds);

    /// Retries any error up to `max_attempts` times with [`Self::DEFAULT_DELAY`].
    pub async fn wrap_for_retry<T, E, F, Fut>(
        operation: F,
        max_attempts: u32,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        Self::wrap_for_retry_with_delay(operation, max_attempts, Self::DEFAULT_DELAY).await
    }

    pub async fn wrap_for_retry_with_delay<T, E, F, Fut>(
        operation: F,
        max_attempts: u32,
        delay: Delay,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        Self::wrap_for_retry_with(operation, RetryWithDelayHandler::new(max_attempts, delay)).await
    }

    pub async fn wrap_for_retry_with<T, E, F, Fut>(
        operation: F,
        handler: RetryWithDelayHandler<E>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        RetryWhen::new(handler).retry(operation).await
    }

    /// Full form: `filter` defaults to retrying any error.
    pub async fn wrap<T, E, F, Fut>(
        operation: F,
        max_attempts: u32,
        delay: Delay,
        filter: Option<RetryFilter<E>>,
        on_retry: Option<OnRetry<E>>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut handler = RetryWithDelayHandler::new(max_attempts, delay)
            .with_filter(filter.unwrap_or(RetryFilter::Any));
        if let Some(on_retry) = on_retry {
            handler = handler.with_on_retry(on_retry);
        }
        Self::wrap_for_retry_with(operation, handler).await
    }
}

/// Pairs each error with its 1-based attempt number, ending after
/// `expected` errors.
pub fn errors_with_attempts<S, E>(errors: S, expected: u32) -> impl Stream<Item = (u32, E)>
where
    S: Stream<Item = E>,
{
    stream::iter(1..=expected).zip(errors)
}
