use crate::consistency::{
    check_appointment_revenue_once, check_conversation_counts, check_platform_revenue,
    check_snapshot_integrity, ConsistencyReport,
};
use crate::errors::{AppError, ResultExt};
use crate::metrics::{
    compute_tenant_metrics, rollup_platform, ConversationMetrics, MetricType, RevenueMetrics,
    TenantMetrics,
};
use crate::metrics_storage::{
    delete_stale_tenant_snapshots, fetch_appointments, fetch_conversations, fetch_payments,
    fetch_tenants, upsert_platform_snapshot, upsert_tenant_snapshot, MetricsStorage, UpsertOutcome,
};
use crate::models::{PlatformMetricSnapshot, TenantMetricSnapshot, TenantMetricsResponse};
use crate::period::MetricPeriod;
use bigdecimal::BigDecimal;
use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use uuid::Uuid;

/// Outcome of one recalculation run.
#[derive(Debug, Clone, Serialize)]
pub struct RecalculationSummary {
    pub period: MetricPeriod,
    pub period_key: String,
    pub tenants: usize,
    pub snapshots_written: usize,
    pub snapshots_unchanged: usize,
    /// Snapshots of tenants no longer in the rollup (e.g. cancelled since the last run).
    pub snapshots_removed: u64,
    pub platform_written: bool,
    pub total_revenue: BigDecimal,
    pub total_conversations: u64,
    pub elapsed_ms: u128,
}

/// Computes, persists and verifies tenant and platform metrics.
#[derive(Clone)]
pub struct MetricsService {
    storage: MetricsStorage,
}

impl MetricsService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            storage: MetricsStorage::new(pool),
        }
    }

    pub fn storage(&self) -> &MetricsStorage {
        &self.storage
    }

    /// Recompute and persist every snapshot of `period`.
    ///
    /// Runs in one transaction holding a per-period advisory lock, so two
    /// concurrent runs for the same period serialize instead of interleaving.
    /// The platform rollup is built from the same `TenantMetrics` values that
    /// are written for the tenants, and snapshots of tenants that left the
    /// rollup are deleted so the stored set matches it.
    pub async fn recalculate(&self, period: &MetricPeriod) -> Result<RecalculationSummary, AppError> {
        let started = Instant::now();
        let period_key = period.key();
        tracing::info!("Recalculating metrics for period {}", period_key);

        let mut tx = self.storage.pool().begin().await.map_err(AppError::DatabaseError)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("tenant-metrics:{}", period_key))
            .execute(&mut *tx)
            .await
            .context("acquiring period lock")?;

        let tenants = fetch_tenants(&mut *tx, false).await?;
        let appointments = fetch_appointments(&mut *tx, period).await?;
        let conversations = fetch_conversations(&mut *tx, period).await?;
        let payments = fetch_payments(&mut *tx, period).await?;

        tracing::debug!(
            "Loaded {} tenants, {} appointments, {} conversations, {} payments",
            tenants.len(),
            appointments.len(),
            conversations.len(),
            payments.len()
        );

        let tenant_metrics: Vec<TenantMetrics> = tenants
            .iter()
            .map(|tenant| {
                compute_tenant_metrics(tenant, period, &appointments, &conversations, &payments)
            })
            .collect();

        let mut snapshots_written = 0;
        let mut snapshots_unchanged = 0;
        for metrics in &tenant_metrics {
            for (metric_type, payload) in metrics.metric_payloads()? {
                match upsert_tenant_snapshot(&mut tx, metrics.tenant_id, period, metric_type, &payload)
                    .await?
                {
                    UpsertOutcome::Written => snapshots_written += 1,
                    UpsertOutcome::Unchanged => snapshots_unchanged += 1,
                }
            }
        }

        let kept: Vec<Uuid> = tenant_metrics.iter().map(|m| m.tenant_id).collect();
        let snapshots_removed = delete_stale_tenant_snapshots(&mut tx, period, &kept).await?;

        let platform = rollup_platform(period, &tenant_metrics);
        let platform_outcome =
            upsert_platform_snapshot(&mut tx, &platform, Utc::now().date_naive()).await?;

        tx.commit().await.map_err(AppError::DatabaseError)?;

        let summary = RecalculationSummary {
            period: *period,
            period_key,
            tenants: tenant_metrics.len(),
            snapshots_written,
            snapshots_unchanged,
            snapshots_removed,
            platform_written: platform_outcome == UpsertOutcome::Written,
            total_revenue: platform.total_revenue,
            total_conversations: platform.total_conversations,
            elapsed_ms: started.elapsed().as_millis(),
        };

        tracing::info!(
            "Recalculated {}: {} tenants, {} snapshots written, {} unchanged, {} removed, revenue {}, {} conversations ({} ms)",
            summary.period_key,
            summary.tenants,
            summary.snapshots_written,
            summary.snapshots_unchanged,
            summary.snapshots_removed,
            summary.total_revenue,
            summary.total_conversations,
            summary.elapsed_ms
        );

        Ok(summary)
    }

    /// Stored snapshots of one tenant.
    pub async fn tenant_snapshots(
        &self,
        tenant_id: Uuid,
        period: &MetricPeriod,
    ) -> Result<TenantMetricsResponse, AppError> {
        if self.storage.find_tenant(tenant_id).await?.is_none() {
            return Err(AppError::NotFound(format!("Tenant {} not found", tenant_id)));
        }

        let snapshots = self.storage.tenant_snapshots(tenant_id, period).await?;
        Ok(TenantMetricsResponse {
            tenant_id,
            period: *period,
            period_key: period.key(),
            snapshots,
        })
    }

    pub async fn platform_snapshot(
        &self,
        period: &MetricPeriod,
    ) -> Result<PlatformMetricSnapshot, AppError> {
        self.storage.platform_snapshot(period).await?.ok_or_else(|| {
            AppError::NotFound(format!(
                "No platform metrics for period {}; run a recalculation first",
                period.key()
            ))
        })
    }

    /// Verify the stored snapshots of `period` against their source rows.
    pub async fn check_consistency(&self, period: &MetricPeriod) -> Result<ConsistencyReport, AppError> {
        let snapshots = self.storage.period_snapshots(period).await?;
        let platform = self.storage.platform_snapshot(period).await?;
        let appointments = fetch_appointments(self.storage.pool(), period).await?;
        let unlinked = self.storage.unlinked_message_count(period).await?;

        let tenant_revenues = revenue_by_tenant(&snapshots)?;
        let stored_conversations = conversations_by_tenant(&snapshots)?;
        let included: HashSet<Uuid> = fetch_tenants(self.storage.pool(), false)
            .await?
            .into_iter()
            .map(|t| t.id)
            .chain(snapshots.iter().map(|s| s.tenant_id))
            .collect();

        // Cancelled tenants without snapshots are outside the rollup
        let history_counts: HashMap<Uuid, u64> = self
            .storage
            .distinct_conversations_per_tenant(period)
            .await?
            .into_iter()
            .filter(|(tenant_id, _)| included.contains(tenant_id))
            .collect();
        let platform_revenue = platform.as_ref().map(|p| &p.total_revenue);

        let report = ConsistencyReport::new(
            *period,
            vec![
                check_platform_revenue(platform_revenue, &tenant_revenues),
                check_conversation_counts(&stored_conversations, &history_counts, unlinked),
                check_appointment_revenue_once(period, &appointments, &included, platform_revenue),
                check_snapshot_integrity(&snapshots, platform.as_ref()),
            ],
        );

        if report.is_consistent() {
            tracing::info!("Period {} is consistent", report.period_key);
        } else {
            for (check, violation) in report.violations() {
                tracing::warn!("[{}] {}: {}", report.period_key, check, violation);
            }
        }

        Ok(report)
    }
}

fn revenue_by_tenant(
    snapshots: &[TenantMetricSnapshot],
) -> Result<Vec<(Uuid, BigDecimal)>, AppError> {
    snapshots
        .iter()
        .filter(|s| s.metric_type == MetricType::Revenue.as_str())
        .map(|s| {
            let revenue: RevenueMetrics = serde_json::from_value(s.metric_data.clone())
                .map_err(AppError::from)
                .with_context(|| format!("decoding revenue snapshot of tenant {}", s.tenant_id))?;
            Ok((s.tenant_id, revenue.revenue))
        })
        .collect()
}

fn conversations_by_tenant(
    snapshots: &[TenantMetricSnapshot],
) -> Result<HashMap<Uuid, u64>, AppError> {
    snapshots
        .iter()
        .filter(|s| s.metric_type == MetricType::Conversations.as_str())
        .map(|s| {
            let conversations: ConversationMetrics = serde_json::from_value(s.metric_data.clone())
                .map_err(AppError::from)
                .with_context(|| {
                    format!("decoding conversation snapshot of tenant {}", s.tenant_id)
                })?;
            Ok((s.tenant_id, conversations.total_conversations))
        })
        .collect()
}
