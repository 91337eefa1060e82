//! Bounded retry for response writes.
//!
//! Wraps a single write operation with retry on transient transport errors.
//! Stream opens are *not* covered here: reopening a stream is a heavier,
//! differently-timed operation governed by the service restart loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::transport::TransportError;

/// Delay between retry attempts.
#[derive(Clone)]
pub enum RetryDelay {
    /// The same delay after every failed attempt.
    Fixed(Duration),
    /// Delay computed from the 1-indexed attempt number.
    PerAttempt(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            RetryDelay::PerAttempt(_) => f.debug_tuple("PerAttempt").field(&"<fn>").finish(),
        }
    }
}

/// Bounded retry policy for a single write.
///
/// Stateless and shared read-only by every write a driver issues.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay inserted between attempts.
    pub delay: RetryDelay,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: RetryDelay::Fixed(Duration::from_millis(100)),
        }
    }
}

impl RetryPolicy {
    /// Policy with a fixed delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: RetryDelay::Fixed(delay),
        }
    }

    /// Policy with a delay computed per attempt.
    pub fn per_attempt(
        max_attempts: u32,
        delay: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_attempts,
            delay: RetryDelay::PerAttempt(Arc::new(delay)),
        }
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match &self.delay {
            RetryDelay::Fixed(d) => *d,
            RetryDelay::PerAttempt(f) => f(attempt),
        }
    }

    /// Run `op`, retrying transient failures up to the attempt budget.
    ///
    /// Cancellation is observed before every attempt and during the
    /// inter-attempt delay, and returns [`TransportError::Cancelled`]
    /// without retrying. Non-transient errors and budget exhaustion
    /// propagate the last error unchanged.
    pub async fn execute<T, F, Fut>(
        &self,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0u32;

        loop {
            if token.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            attempt += 1;

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient write failure, retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(TransportError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
