use std::time::Duration;

use crate::core::providers::ProviderError;

/// Bounded retry with a fixed delay. The decision is a pure function of
/// the error kind and the attempts already made, so the executor's loop
/// stays free of nested error handling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// `attempts_made` counts the attempt that just failed.
    pub fn decide(&self, error: &ProviderError, attempts_made: u32) -> RetryDecision {
        if error.is_transient() && attempts_made < self.max_attempts {
            RetryDecision::Retry { delay: self.delay }
        } else {
            RetryDecision::GiveUp
        }
    }
}
