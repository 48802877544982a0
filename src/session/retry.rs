//! Connect retry policy
//!
//! Exponential backoff between connection attempts, capped, with optional jitter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total connection attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff multiplier for each further attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on a single delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Add up to 25% random delay to spread out reconnect storms
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Set custom backoff parameters
    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.backoff_multiplier = multiplier;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Attempts actually made; a zero setting still tries once
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Delay after failed attempt number `attempt` (0-based), before the next one
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let delay_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64)
    .max(0.0) as u64;

    let jitter_ms = if config.jitter && delay_ms > 0 {
        rand::random::<u64>() % (delay_ms / 4 + 1)
    } else {
        0
    };

    Duration::from_millis(delay_ms + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff() {
        let config = RetryConfig::default();

        assert_eq!(calculate_backoff(0, &config), Duration::from_millis(1000));
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(2000));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(4000));
        assert_eq!(calculate_backoff(3, &config), Duration::from_millis(8000));
        assert_eq!(calculate_backoff(4, &config), Duration::from_millis(10_000)); // capped
        assert_eq!(calculate_backoff(20, &config), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig::default().with_jitter(true);
        for _ in 0..50 {
            let delay = calculate_backoff(1, &config);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        assert_eq!(RetryConfig::new(0).attempts(), 1);
        assert_eq!(RetryConfig::default().attempts(), 3);
    }
}
