//! Single retry for ledger and descriptor reads.
//!
//! A read that fails with a transient error is attempted once more after a short delay.
//! Submissions never go through here: resubmitting could pay twice.

use std::time::Duration;

use mech_core::{descriptor::DescriptorError, errors::LedgerError};
use tokio::time::sleep;

/// Errors that can tell whether trying again might succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for LedgerError {
    fn is_transient(&self) -> bool {
        LedgerError::is_transient(self)
    }
}

impl Transient for DescriptorError {
    fn is_transient(&self) -> bool {
        DescriptorError::is_transient(self)
    }
}

/// Retry policy for reads: at most one extra attempt, only after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRetry {
    delay: Duration,
}

impl ReadRetry {
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);

    pub fn new(delay: Duration) -> Self {
        ReadRetry { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub async fn run<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        match operation().await {
            Err(err) if err.is_transient() => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Transient read failure, retrying once: {err}");
                sleep(self.delay).await;
                operation().await
            }
            result => result,
        }
    }
}

impl Default for ReadRetry {
    fn default() -> Self {
        ReadRetry::new(Self::DEFAULT_DELAY)
    }
}
