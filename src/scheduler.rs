//! Background recalculation of the current month's metrics.

use chrono::Utc;
use failsafe::CircuitBreaker;
use moka::future::Cache;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::circuit_breaker::create_recalculation_circuit_breaker;
use crate::period::MetricPeriod;
use crate::services::MetricsService;

/// Spawns a task recalculating the current calendar month every `interval`.
///
/// Failed runs feed the circuit breaker; while it is open, ticks are skipped.
/// Successful runs clear the read cache so handlers serve fresh snapshots.
pub fn spawn_recalculation_loop(
    service: MetricsService,
    interval: Duration,
    cache: Cache<String, serde_json::Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let breaker = create_recalculation_circuit_breaker();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if !breaker.is_call_permitted() {
                tracing::warn!("Recalculation circuit open, skipping scheduled run");
                continue;
            }

            let period = MetricPeriod::current_month(Utc::now().date_naive());
            let result = service.recalculate(&period).await;

            match breaker.call(move || result) {
                Ok(summary) => {
                    cache.invalidate_all();
                    tracing::debug!(
                        "Scheduled recalculation of {} done ({} written)",
                        summary.period_key,
                        summary.snapshots_written
                    );
                }
                Err(failsafe::Error::Inner(e)) => {
                    tracing::error!("Scheduled recalculation of {} failed: {}", period, e);
                }
                Err(failsafe::Error::Rejected) => {
                    tracing::warn!("Scheduled recalculation rejected by circuit breaker");
                }
            }
        }
    })
}
