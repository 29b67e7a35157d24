use std::fmt;
use std::sync::Arc;

pub type ErrorMatcher<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Decides whether an error may be retried.
pub enum RetryFilter<E> {
    /// Every error is retriable.
    Any,
    /// Only errors the matcher accepts are retriable.
    AllowList(ErrorMatcher<E>),
    /// Errors the matcher accepts are passed through, everything else is retried.
    DenyList(ErrorMatcher<E>),
    /// Arbitrary predicate; `true` means retry.
    Predicate(ErrorMatcher<E>),
    Inverted(Box<RetryFilter<E>>),
}

impl<E> RetryFilter<E> {
    pub fn allow<F>(matcher: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self::AllowList(Arc::new(matcher))
    }

    pub fn deny<F>(matcher: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self::DenyList(Arc::new(matcher))
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    pub fn inverted(self) -> Self {
        Self::Inverted(Box::new(self))
    }

    pub fn should_retry(&self, err: &E) -> bool {
        match self {
            Self::Any => true,
            Self::AllowList(matcher) | Self::Predicate(matcher) => matcher(err),
            Self::DenyList(matcher) => !matcher(err),
            Self::Inverted(inner) => !inner.should_retry(err),
        }
    }
}

impl<E> Clone for RetryFilter<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Any => Self::Any,
            Self::AllowList(matcher) => Self::AllowList(Arc::clone(matcher)),
            Self::DenyList(matcher) => Self::DenyList(Arc::clone(matcher)),
            Self::Predicate(matcher) => Self::Predicate(Arc::clone(matcher)),
            Self::Inverted(inner) => Self::Inverted(inner.clone()),
        }
    }
}

impl<E> fmt::Debug for RetryFilter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::AllowList(_) => f.write_str("AllowList(..)"),
            Self::DenyList(_) => f.write_str("DenyList(..)"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
            Self::Inverted(inner) => f.debug_tuple("Inverted").field(inner).finish(),
        }
    }
}
