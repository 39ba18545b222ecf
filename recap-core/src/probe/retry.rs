use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::ProbeSection;

/// How a failed attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: usize,
    interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },
    #[error("permanent failure on attempt {attempts}: {error}")]
    Permanent { attempts: usize, error: E },
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: usize },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Permanent { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    pub fn from_probe_config(config: &ProbeSection) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_secs(config.retry_interval_seconds),
        )
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs `operation` until it succeeds, `classify` returns
    /// [`Disposition::Abort`], the attempt budget runs out or `cancel` fires.
    /// `on_retry` sees every failure that will be retried together with the
    /// number of attempts still left.
    pub async fn run<F, Fut, T, E, C, N>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        classify: C,
        mut on_retry: N,
    ) -> Result<RetryOutcome<T>, RetryError<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Disposition,
        N: FnMut(&E, usize),
    {
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                result = operation(attempt) => result,
            };
            attempt += 1;
            let error = match result {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt,
                    })
                }
                Err(error) => error,
            };
            if classify(&error) == Disposition::Abort {
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    error,
                });
            }
            if attempt >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }
            on_retry(&error, self.max_attempts - attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                _ = sleep(self.interval) => {}
            }
        }
    }
}
