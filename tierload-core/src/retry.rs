//! Bounded retry with escalating backoff.
//!
//! A region gets `max_attempts` loader invocations in total. After each failed
//! attempt short of the ceiling the manager hands back the delay before the
//! next one; the delays never decrease and never exceed `max_backoff`. Once
//! the ceiling is reached the region's retry state is dropped and the caller
//! moves it to the terminal failed state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::LoadError;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total loader invocations allowed, first attempt included
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Upper bound for any delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            initial_backoff: std::env::var("TIERLOAD_RETRY_INITIAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: std::env::var("TIERLOAD_RETRY_MAX_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            ..defaults
        }
    }

    /// Delay before the attempt that follows `failed_attempts` failures
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_backoff.as_millis() as f64 * factor)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }
}

/// Per-region retry bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    pub region_id: String,
    /// Failed attempts so far
    pub attempts: u32,
    /// Delay scheduled before the next attempt
    pub next_delay: Duration,
    pub last_error: LoadError,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Try again after the delay
    RetryAfter(Duration),
    /// Budget used up, region must fail
    Exhausted { attempts: u32, last_error: LoadError },
}

/// Tracks failures per region and decides between retry and giving up
#[derive(Debug, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
    states: HashMap<String, RetryState>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, states: HashMap::new() }
    }

    /// Record a failed attempt for a region
    pub fn record_failure(&mut self, region_id: &str, error: LoadError) -> RetryDecision {
        let ceiling = self.policy.max_attempts.max(1);
        let attempts = self.states.get(region_id).map_or(0, |s| s.attempts) + 1;

        if attempts >= ceiling {
            self.states.remove(region_id);
            return RetryDecision::Exhausted { attempts, last_error: error };
        }

        let next_delay = self.policy.delay_after(attempts);
        self.states.insert(
            region_id.to_string(),
            RetryState {
                region_id: region_id.to_string(),
                attempts,
                next_delay,
                last_error: error,
            },
        );
        RetryDecision::RetryAfter(next_delay)
    }

    /// Forget a region, on success, manual retry or unregistration
    pub fn clear(&mut self, region_id: &str) {
        self.states.remove(region_id);
    }

    /// Failed attempts recorded for a region
    pub fn attempts(&self, region_id: &str) -> u32 {
        self.states.get(region_id).map_or(0, |s| s.attempts)
    }

    pub fn state(&self, region_id: &str) -> Option<&RetryState> {
        self.states.get(region_id)
    }

    /// Regions currently waiting for a retry
    pub fn pending(&self) -> usize {
        self.states.len()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
