//! Pool health check
//!
//! A background task wakes every `health_interval_secs` and evicts sessions
//! that are disconnected or have been idle for longer than
//! `idle_timeout_secs`. Sessions that are in use are left alone until the next
//! pass. A session whose check or teardown panics or hangs is evicted anyway
//! and does not stop the pass.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::connection_pool::{ConnectionPool, Slot};
use crate::session::EvictReason;

/// Outcome of one health check pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Sessions inspected
    pub checked: usize,
    pub evicted: Vec<(String, EvictReason)>,
    /// Aliases skipped because a caller held them
    pub busy: Vec<String>,
    /// Checks or teardowns that panicked or timed out
    pub failures: usize,
}

impl ConnectionPool {
    /// Start the background health check; false if it is already running
    ///
    /// The task only holds a weak reference and exits once the pool is gone.
    pub fn start_health_check(self: &Arc<Self>) -> bool {
        let mut task = self.health_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }

        let pool = Arc::downgrade(self);
        let period = self.options.pool.health_interval();

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };

                let report = pool.health_pass().await;
                if report.evicted.is_empty() && report.failures == 0 {
                    debug!(
                        "Health check: {} sessions OK, {} busy",
                        report.checked,
                        report.busy.len()
                    );
                } else {
                    info!(
                        "Health check: evicted {} of {} sessions ({} failures, {} busy)",
                        report.evicted.len(),
                        report.checked,
                        report.failures,
                        report.busy.len()
                    );
                }
            }

            debug!("Health check task exiting, pool dropped");
        }));

        info!("Health check started (interval={}s)", period.as_secs());
        true
    }

    /// Stop the background health check; false if it was not running
    pub fn stop_health_check(&self) -> bool {
        match self.health_task.lock().take() {
            Some(task) => {
                let was_running = !task.is_finished();
                task.abort();
                if was_running {
                    info!("Health check stopped");
                }
                was_running
            }
            None => false,
        }
    }

    pub fn is_health_check_running(&self) -> bool {
        self.health_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Run one health check pass now
    pub async fn health_pass(&self) -> HealthReport {
        self.health_pass_at(Instant::now()).await
    }

    pub(crate) async fn health_pass_at(&self, now: Instant) -> HealthReport {
        let idle_timeout = self.options.pool.idle_timeout();
        let check_timeout = self.options.pool.check_timeout();
        let slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut report = HealthReport::default();

        for (alias, slot) in slots {
            let Ok(mut guard) = slot.clone().try_lock_owned() else {
                debug!("Skipping health check for {}, session in use", alias);
                report.busy.push(alias);
                continue;
            };
            if !self.is_current(&alias, &slot) {
                continue;
            }

            let verdict = match guard.as_ref() {
                Some(session) => std::panic::catch_unwind(AssertUnwindSafe(|| {
                    session.eviction_reason(now, idle_timeout)
                })),
                None => {
                    // Left behind by a connect that never finished
                    self.forget_slot(&alias, &slot);
                    continue;
                }
            };
            report.checked += 1;

            let reason = match verdict {
                Ok(None) => continue,
                Ok(Some(reason)) => reason,
                Err(_) => {
                    error!("Health check for {} panicked, evicting it", alias);
                    report.failures += 1;
                    EvictReason::CheckFailed
                }
            };

            self.forget_slot(&alias, &slot);
            if let Some(mut session) = guard.take() {
                let closing = AssertUnwindSafe(async move { session.close().await }).catch_unwind();
                match tokio::time::timeout(check_timeout, closing).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        error!("Closing {} panicked", alias);
                        report.failures += 1;
                    }
                    Err(_) => {
                        warn!(
                            "Closing {} did not finish within {}s, abandoning it",
                            alias,
                            check_timeout.as_secs()
                        );
                        report.failures += 1;
                    }
                }
            }

            info!("Evicted session for {} ({})", alias, reason);
            report.evicted.push((alias, reason));
        }

        report
    }
}
