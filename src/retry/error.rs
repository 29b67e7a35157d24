use thiserror::Error;

/// Failure of a retried operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// More than the allowed number of retries happened; carries the last error.
    #[error("maximum number of attempts reached after {retries} retries")]
    Exhausted {
        retries: u32,
        #[source]
        cause: E,
    },

    /// The error is not retriable and is passed through unchanged.
    #[error(transparent)]
    Aborted(E),
}

impl<E> RetryError<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    pub fn cause(&self) -> &E {
        match self {
            Self::Exhausted { cause, .. } | Self::Aborted(cause) => cause,
        }
    }

    pub fn into_cause(self) -> E {
        match self {
            Self::Exhausted { cause, .. } | Self::Aborted(cause) => cause,
        }
    }
}
