//! Immediate-retry policy for transient data-store errors.
//!
//! The policy wraps an async operation and retries it immediately, up to a
//! fixed attempt ceiling, whenever the supplied predicate classifies the
//! failure as transient. Non-transient errors propagate on the first attempt;
//! exhausting the ceiling propagates the last error unchanged. Backoff is
//! deliberately absent: the retried failures (serialization conflicts,
//! connection blips) resolve on re-execution, not on delay.

use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use crate::error::{is_transient_pg_error, Result, SqlTransportError};

/// Default attempt ceiling used by [`RetryPolicy::pg_default`]
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Classifier deciding whether an error is safe to retry immediately
pub type TransientPredicate = Arc<dyn Fn(&SqlTransportError) -> bool + Send + Sync>;

/// Fixed-ceiling immediate-retry policy
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    is_transient: TransientPredicate,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Create a policy with an explicit ceiling and transient predicate.
    ///
    /// A ceiling of zero is treated as one attempt.
    pub fn new(max_attempts: u32, is_transient: TransientPredicate) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            is_transient,
        }
    }

    /// Default policy for PostgreSQL: 10 attempts with the SQLSTATE-based
    /// predicate from [`crate::error::is_transient_pg_error`]
    pub fn pg_default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Arc::new(is_transient_pg_error))
    }

    /// The attempt ceiling
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Classify an error with this policy's predicate
    pub fn is_transient(&self, error: &SqlTransportError) -> bool {
        (self.is_transient)(error)
    }

    /// Run `op`, retrying transient failures immediately up to the ceiling.
    ///
    /// `op` is re-invoked from scratch on each attempt, so it must be safe to
    /// re-execute (callers with per-attempt state, like an already-open
    /// connection, run their own loop against [`Self::is_transient`] and
    /// [`Self::max_attempts`] instead).
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts && self.is_transient(&error) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "transient failure, retrying"
                    );
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
