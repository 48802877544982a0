//! Connection Pool
//!
//! Keyed by server alias. Sessions are created on first use from the server
//! registry and the credential vault, reused while they stay connected, and
//! evicted by a background health check once they die or go idle.

mod breaker;
mod connection_pool;
mod health;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use connection_pool::{
    CommandResult, ConnectionPool, KillOutcome, PoolConfig, PoolError, PoolOptions, PoolStats,
    PooledSession, PooledStream,
};
pub use health::HealthReport;
