//! Time budget for a single reconciliation attempt.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ProviderError;

/// Default ceiling for one reconciliation pass of a service.
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Deadline passed explicitly into every provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// A deadline no later than this one and no later than `budget` from now.
    pub fn shorten(&self, budget: Duration) -> Self {
        Self {
            at: self.at.min(Instant::now() + budget),
        }
    }

    /// Fail with [`ProviderError::DeadlineExceeded`] once the deadline has passed.
    ///
    /// Guards calls that return without awaiting, which [`Deadline::run`] cannot
    /// interrupt.
    pub fn check(&self) -> Result<(), ProviderError> {
        if self.is_expired() {
            return Err(ProviderError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Run `fut` until it completes or the deadline passes.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ProviderError> {
        tokio::time::timeout_at(self.at, fut)
            .await
            .map_err(|_| ProviderError::DeadlineExceeded)
    }
}
