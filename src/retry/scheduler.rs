use futures::future::BoxFuture;
use std::time::Duration;

/// Timer used to wait between attempts. Swap it out to control time in tests.
pub trait RetryScheduler: Send + Sync {
    fn delay(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Non-blocking tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl RetryScheduler for TokioScheduler {
    fn delay(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
