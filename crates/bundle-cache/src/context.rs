use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::CacheError;

/// Bounds how long a caller is willing to wait for a resource.
///
/// A context carries an optional deadline and an optional [`CancellationToken`]. It only bounds
/// the caller's own wait: when it fires, the caller gets a [`CacheError::DeadlineExceeded`] or
/// [`CacheError::Canceled`], while the construction of the resource continues for everybody else.
///
/// Dropping the future returned by [`ResourceCache::with_resource`](crate::ResourceCache::with_resource)
/// has the same effect as canceling it.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    deadline: Option<(Instant, Duration)>,
    cancel: Option<CancellationToken>,
}

impl RequestContext {
    /// A context that never fires.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().timeout(timeout)
    }

    /// Sets the deadline to `timeout` from now.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some((Instant::now() + timeout, timeout));
        self
    }

    /// Ties this context to the given cancellation token.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The instant after which waiting stops, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|(deadline, _)| deadline)
    }

    /// Returns the error this context resolves to if it is already done.
    pub fn err(&self) -> Option<CacheError> {
        if self.cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
            return Some(CacheError::Canceled);
        }
        match self.deadline {
            Some((deadline, timeout)) if Instant::now() >= deadline => {
                Some(CacheError::DeadlineExceeded(timeout))
            }
            _ => None,
        }
    }

    /// Resolves once this context is done, with the corresponding error.
    ///
    /// Never resolves for a context without deadline and cancellation token.
    pub async fn done(&self) -> CacheError {
        let deadline = async {
            match self.deadline {
                Some((deadline, timeout)) => {
                    tokio::time::sleep_until(deadline).await;
                    CacheError::DeadlineExceeded(timeout)
                }
                None => std::future::pending().await,
            }
        };
        let canceled = async {
            match &self.cancel {
                Some(token) => {
                    token.cancelled().await;
                    CacheError::Canceled
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            err = canceled => err,
            err = deadline => err,
        }
    }

    /// Runs `future` until it completes or this context is done.
    pub(crate) async fn run<F, T>(&self, future: F) -> Result<T, CacheError>
    where
        F: Future<Output = T>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            output = future => Ok(output),
            err = self.done() => Err(err),
        }
    }
}
