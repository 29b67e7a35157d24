use crate::retry::delay::{Delay, TimeUnit};
use crate::retry::error::RetryError;
use crate::retry::filter::RetryFilter;
use crate::retry::scheduler::{RetryScheduler, TokioScheduler};
use std::sync::Arc;
use std::time::Duration;

/// Hook fired before each scheduled retry with
/// `(attempt, error, delay, unit)`.
pub type OnRetry<E> = Arc<dyn Fn(u32, &E, u64, TimeUnit) + Send + Sync>;

/// Largest usable `max_attempts`; one is added internally to count the
/// exhausting error.
pub const MAX_ATTEMPTS_LIMIT: u32 = u32::MAX - 1;

#[derive(Debug)]
pub enum RetryDecision<E> {
    Retry { attempt: u32, delay: Duration },
    Stop(RetryError<E>),
}

/// Resolves each failed attempt into a delayed retry, a pass-through, or
/// exhaustion.
pub struct RetryWithDelayHandler<E> {
    max_attempts: u32,
    delay: Delay,
    filter: RetryFilter<E>,
    scheduler: Arc<dyn RetryScheduler>,
    on_retry: Option<OnRetry<E>>,
}

impl<E> RetryWithDelayHandler<E> {
    /// Retries any error up to `max_attempts` times on the tokio timer.
    pub fn new(max_attempts: u32, delay: Delay) -> Self {
        Self {
            max_attempts: max_attempts.min(MAX_ATTEMPTS_LIMIT),
            delay,
            filter: RetryFilter::Any,
            scheduler: Arc::new(TokioScheduler),
            on_retry: None,
        }
    }

    pub fn with_filter(mut self, filter: RetryFilter<E>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn RetryScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_on_retry(mut self, on_retry: OnRetry<E>) -> Self {
        self.on_retry = Some(on_retry);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> &Delay {
        &self.delay
    }

    pub fn scheduler(&self) -> &Arc<dyn RetryScheduler> {
        &self.scheduler
    }

    /// Decides what to do with the error of 1-based attempt `attempt`.
    ///
    /// Exhaustion is checked before the filter, so the last error is always
    /// wrapped even when it would not have been retried.
    pub fn decide(&self, attempt: u32, err: E) -> RetryDecision<E> {
        if attempt > self.max_attempts {
            return RetryDecision::Stop(RetryError::Exhausted {
                retries: self.max_attempts,
                cause: err,
            });
        }
        if !self.filter.should_retry(&err) {
            return RetryDecision::Stop(RetryError::Aborted(err));
        }

        let amount = self.delay.calculate(attempt);
        let unit = self.delay.unit();
        if let Some(on_retry) = &self.on_retry {
            on_retry(attempt, &err, amount, unit);
        }
        RetryDecision::Retry {
            attempt,
            delay: unit.to_duration(amount),
        }
    }

    /// Like [`decide`](Self::decide), but waits out the delay on the
    /// scheduler before returning the attempt number.
    pub async fn handle(&self, attempt: u32, err: E) -> Result<u32, RetryError<E>> {
        match self.decide(attempt, err) {
            RetryDecision::Retry { attempt, delay } => {
                self.scheduler.delay(delay).await;
                Ok(attempt)
            }
            RetryDecision::Stop(err) => Err(err),
        }
    }
}
