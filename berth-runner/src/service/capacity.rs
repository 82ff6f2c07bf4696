//! Capacity gate
//!
//! Caps the number of simultaneously running builds, per concurrency
//! constraint. The default constraint gets the configured container cap;
//! every other constraint gets a small fixed cap so auxiliary pools (matrix
//! sub-builds, for instance) make progress without starving the main pool.
//!
//! A build waiting for a slot retries with exponential backoff, forever. The
//! wait is only ever ended by admission or by cancellation.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// First delay after a refused admission
pub const BASE_RETRY_DELAY: Duration = Duration::from_millis(2_000);

/// Ceiling for the admission delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(60_000);

/// Cap applied to every constraint other than the default one
pub const DEFAULT_CONSTRAINT_CAP: usize = 2;

/// Errors raised while waiting for admission
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The wait was cancelled before a slot was reserved
    #[error("Admission for constraint '{0}' was aborted")]
    Aborted(String),
}

/// Exponential backoff: doubles after every delay, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { next: base, max }
    }

    /// Returns the delay to wait now and advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BASE_RETRY_DELAY, MAX_RETRY_DELAY)
    }
}

/// Process-wide count of running builds per constraint
///
/// Shared between all orchestrators through an `Arc`. Every check-and-update
/// happens under a single lock acquisition.
pub struct CapacityGate {
    counts: Mutex<HashMap<String, usize>>,
    container_cap: usize,
    constraint_cap: usize,
    default_constraint: String,
    base_delay: Duration,
    max_delay: Duration,
}

impl CapacityGate {
    /// Creates a gate capping the default constraint at `container_cap`
    pub fn new(container_cap: usize, default_constraint: impl Into<String>) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            container_cap,
            constraint_cap: DEFAULT_CONSTRAINT_CAP,
            default_constraint: default_constraint.into(),
            base_delay: BASE_RETRY_DELAY,
            max_delay: MAX_RETRY_DELAY,
        }
    }

    /// Overrides the cap of non-default constraints
    pub fn with_constraint_cap(mut self, constraint_cap: usize) -> Self {
        self.constraint_cap = constraint_cap;
        self
    }

    /// Overrides the admission backoff
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn default_constraint(&self) -> &str {
        &self.default_constraint
    }

    /// Maximum number of running builds for a constraint
    pub fn limit(&self, constraint: &str) -> usize {
        if constraint == self.default_constraint {
            self.container_cap
        } else {
            self.constraint_cap
        }
    }

    /// Current number of running builds for a constraint
    pub fn count(&self, constraint: &str) -> usize {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(constraint).copied().unwrap_or(0)
    }

    /// Reserves a slot if the constraint is under its limit
    pub fn try_admit(&self, constraint: &str) -> bool {
        let limit = self.limit(constraint);
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(constraint.to_string()).or_insert(0);

        if *count < limit {
            *count += 1;
            true
        } else {
            false
        }
    }

    /// Frees a slot; never drops below zero
    pub fn release(&self, constraint: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = counts.get_mut(constraint) {
            *count = count.saturating_sub(1);
        }
    }

    /// Waits until a slot for `constraint` is reserved
    ///
    /// Retries with exponential backoff until admitted. Cancelling `cancel`
    /// ends the wait with `AdmissionError::Aborted` and leaves the counts
    /// untouched.
    pub async fn admit(
        &self,
        constraint: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdmissionError> {
        let limit = self.limit(constraint);
        let mut backoff = Backoff::new(self.base_delay, self.max_delay);

        loop {
            if cancel.is_cancelled() {
                return Err(AdmissionError::Aborted(constraint.to_string()));
            }

            if self.try_admit(constraint) {
                info!(
                    "Capacity limit not reached for constraint '{}' (limit {}): launching",
                    constraint, limit
                );
                return Ok(());
            }

            let delay = backoff.next_delay();
            warn!(
                "Capacity limit reached with {}/{} container(s) for constraint '{}': postponing launch by {} ms",
                self.count(constraint),
                limit,
                constraint,
                delay.as_millis()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(AdmissionError::Aborted(constraint.to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
