//! Per-alias circuit breaker
//!
//! After `fail_threshold` consecutive failed connects an alias is refused for
//! `cool_off_secs`. When the cool-off has passed the breaker resets and the
//! next request is let through. A successful connect resets it immediately.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker; 0 disables it
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,

    #[serde(default = "default_cool_off_secs")]
    pub cool_off_secs: u64,
}

fn default_fail_threshold() -> u32 {
    5
}

fn default_cool_off_secs() -> u64 {
    30
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: default_fail_threshold(),
            cool_off_secs: default_cool_off_secs(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BreakerState {
    fails: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: DashMap<String, BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    fn cool_off(&self) -> Duration {
        Duration::from_secs(self.config.cool_off_secs)
    }

    /// `Err(remaining)` while the breaker for `alias` is open
    pub fn check(&self, alias: &str) -> Result<(), Duration> {
        if self.config.fail_threshold == 0 {
            return Ok(());
        }

        let opened_at = match self.states.get(alias).and_then(|s| s.opened_at) {
            Some(opened_at) => opened_at,
            None => return Ok(()),
        };

        let elapsed = opened_at.elapsed();
        if elapsed < self.cool_off() {
            return Err(self.cool_off() - elapsed);
        }

        self.states.remove(alias);
        Ok(())
    }

    pub fn record_success(&self, alias: &str) {
        self.states.remove(alias);
    }

    pub fn record_failure(&self, alias: &str) {
        if self.config.fail_threshold == 0 {
            return;
        }

        let mut state = self.states.entry(alias.to_string()).or_default();
        state.fails += 1;
        if state.fails >= self.config.fail_threshold && state.opened_at.is_none() {
            state.opened_at = Some(Instant::now());
            warn!(
                "Circuit breaker opened for {} after {} failures, cooling off for {}s",
                alias, state.fails, self.config.cool_off_secs
            );
        }
    }

    pub fn failures(&self, alias: &str) -> u32 {
        self.states.get(alias).map(|s| s.fails).unwrap_or(0)
    }
}
