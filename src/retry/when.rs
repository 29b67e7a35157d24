use crate::retry::error::RetryError;
use crate::retry::errors_with_attempts;
use crate::retry::handler::{RetryDecision, RetryWithDelayHandler};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::future::{Future, ready};
use std::sync::Arc;

/// Applies a [`RetryWithDelayHandler`] to an operation or to a stream of
/// errors.
pub struct RetryWhen<E> {
    handler: Arc<RetryWithDelayHandler<E>>,
}

impl<E> Clone for RetryWhen<E> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<E> RetryWhen<E> {
    pub fn new(handler: RetryWithDelayHandler<E>) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    pub fn handler(&self) -> &RetryWithDelayHandler<E> {
        &self.handler
    }

    /// Runs `operation` until it succeeds, the error is not retriable, or the
    /// retries run out.
    pub async fn retry<T, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    self.handler.handle(attempt, err).await?;
                }
            }
        }
    }
}

impl<E: Send + 'static> RetryWhen<E> {
    /// Turns a stream of errors from failed attempts into a stream of retry
    /// triggers.
    ///
    /// Each trigger is emitted once its delay has elapsed. The stream ends
    /// after the first `Err`, which carries the pass-through or exhausted
    /// error.
    pub fn triggers<S>(&self, errors: S) -> BoxStream<'static, Result<u32, RetryError<E>>>
    where
        S: Stream<Item = E> + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let expected = handler.max_attempts().saturating_add(1);
        errors_with_attempts(errors, expected)
            .then(move |(attempt, err)| {
                let handler = Arc::clone(&handler);
                async move {
                    match handler.decide(attempt, err) {
                        RetryDecision::Retry { attempt, delay } => {
                            handler.scheduler().delay(delay).await;
                            Ok(attempt)
                        }
                        RetryDecision::Stop(err) => Err(err),
                    }
                }
            })
            .scan(false, |stopped, trigger| {
                if *stopped {
                    return ready(None);
                }
                *stopped = trigger.is_err();
                ready(Some(trigger))
            })
            .boxed()
    }
}
