use crate::retry::Retry;
use crate::retry::delay::{Delay, TimeUnit};
use crate::retry::filter::RetryFilter;
use crate::retry::handler::RetryWithDelayHandler;
use crate::retry::scheduler::{RetryScheduler, TokioScheduler};
use crate::retry::when::RetryWhen;
use std::sync::Arc;

/// Fluent construction of a [`RetryWhen`].
///
/// Defaults to one retry with [`Retry::DEFAULT_DELAY`] on the tokio timer.
///
/// # Examples
///
/// ```
/// use clustertopo::{Delay, RetryBuilder, TimeUnit};
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// # tokio_test::block_on(async {
/// let attempts = &AtomicU32::new(0);
/// let retry = RetryBuilder::any()
///     .max(3)
///     .delay(Delay::fixed(1, TimeUnit::Milliseconds))
///     .build();
///
/// let value = retry
///     .retry(move || async move {
///         match attempts.fetch_add(1, Ordering::SeqCst) {
///             0 => Err("busy"),
///             n => Ok(n),
///         }
///     })
///     .await
///     .unwrap();
/// assert_eq!(value, 1);
/// # });
/// ```
pub struct RetryBuilder<E> {
    max_attempts: u32,
    delay: Delay,
    filter: RetryFilter<E>,
    scheduler: Arc<dyn RetryScheduler>,
    on_retry: Option<Arc<dyn Fn(u32, &E, u64, TimeUnit) + Send + Sync>>,
}

impl<E> RetryBuilder<E> {
    fn with_filter(filter: RetryFilter<E>) -> Self {
        Self {
            max_attempts: 1,
            delay: Retry::DEFAULT_DELAY,
            filter,
            scheduler: Arc::new(TokioScheduler),
            on_retry: None,
        }
    }

    /// Retry on any error.
    pub fn any() -> Self {
        Self::with_filter(RetryFilter::Any)
    }

    /// Retry only on errors `matcher` accepts.
    pub fn any_of<F>(matcher: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self::with_filter(RetryFilter::allow(matcher))
    }

    /// Retry on every error except those `matcher` accepts.
    pub fn all_but<F>(matcher: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self::with_filter(RetryFilter::deny(matcher))
    }

    /// Retry when `predicate` holds.
    pub fn any_matches<F>(predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self::with_filter(RetryFilter::predicate(predicate))
    }

    pub fn max(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn once(self) -> Self {
        self.max(1)
    }

    pub fn delay(mut self, delay: Delay) -> Self {
        self.delay = delay;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn RetryScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn do_on_retry<F>(mut self, on_retry: F) -> Self
    where
        F: Fn(u32, &E, u64, TimeUnit) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(on_retry));
        self
    }

    pub fn build(self) -> RetryWhen<E> {
        let mut handler = RetryWithDelayHandler::new(self.max_attempts, self.delay)
            .with_filter(self.filter)
            .with_scheduler(self.scheduler);
        if let Some(on_retry) = self.on_retry {
            handler = handler.with_on_retry(on_retry);
        }
        RetryWhen::new(handler)
    }
}
