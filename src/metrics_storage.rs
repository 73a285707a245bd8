use crate::checksum::payload_checksum;
use crate::conversation::{
    aggregate_sessions, context_duration_minutes, conversation_id, session_key,
};
use crate::errors::{AppError, ResultExt};
use crate::metrics::{MetricType, PlatformMetrics};
use crate::models::{
    Appointment, Conversation, ConversationMessage, IngestResponse, NewConversationMessage,
    PlatformMetricSnapshot, SubscriptionPayment, Tenant, TenantMetricSnapshot,
};
use crate::period::MetricPeriod;
use bigdecimal::{BigDecimal, Zero};
use chrono::{NaiveDate, Utc};
use sqlx::{PgConnection, PgExecutor, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

/// Whether an upsert changed the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Written,
    Unchanged,
}

/// Database storage for conversations and metric snapshots
#[derive(Clone)]
pub struct MetricsStorage {
    pool: PgPool,
}

impl MetricsStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn find_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, AppError> {
        sqlx::query_as::<_, Tenant>(
            r#"
            SELECT id, business_name, domain, subscription_plan, monthly_subscription_fee,
                   status, created_at, trial_ends_at
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading tenant")
    }

    /// Ingest one message and fold it into its conversation.
    ///
    /// The message insert and the conversation update run in one transaction
    /// holding the tenant's conversation lock, shared with rebuilds. Messages
    /// for unknown tenants are rejected with `NotFound`. A message id that already exists is reported as a duplicate and leaves
    /// the conversation untouched, so replays never double count.
    pub async fn ingest_message(
        &self,
        new_message: NewConversationMessage,
    ) -> Result<IngestResponse, AppError> {
        let message = new_message.into_message(Utc::now());
        let key = session_key(message.conversation_context.as_ref(), message.id);
        let conversation_id = conversation_id(message.tenant_id, &key);

        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        lock_tenant_conversations(&mut tx, message.tenant_id).await?;

        let tenant_exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM tenants WHERE id = $1)")
                .bind(message.tenant_id)
                .fetch_one(&mut *tx)
                .await
                .context("checking message tenant")?;
        if !tenant_exists {
            return Err(AppError::NotFound(format!(
                "Tenant {} not found",
                message.tenant_id
            )));
        }

        // Step 1: Insert the message unlinked; the conversation row may not exist yet
        let inserted = sqlx::query(
            r#"
            INSERT INTO conversation_history (
                id, tenant_id, user_id, content, is_from_user, conversation_context,
                conversation_outcome, confidence_score, api_cost_usd, processing_cost_usd,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id)
        .bind(message.tenant_id)
        .bind(message.user_id)
        .bind(&message.content)
        .bind(message.is_from_user)
        .bind(&message.conversation_context)
        .bind(&message.conversation_outcome)
        .bind(message.confidence_score)
        .bind(&message.api_cost_usd)
        .bind(&message.processing_cost_usd)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .context("inserting conversation message")?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(AppError::DatabaseError)?;
            tracing::debug!("Message {} already ingested, skipping", message.id);
            return Ok(IngestResponse {
                message_id: message.id,
                conversation_id,
                session_key: key,
                duplicate: true,
            });
        }

        // Step 2: Upsert the conversation incrementally
        let outcomes: Vec<String> = message.conversation_outcome.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO conversations (
                id, tenant_id, session_key, user_id, started_at, last_message_at,
                message_count, user_message_count, api_cost_usd, processing_cost_usd,
                duration_minutes, observed_outcomes, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $5, 1, $6, $7, $8, $9, $10, now())
            ON CONFLICT (id) DO UPDATE
            SET user_id = CASE
                    WHEN EXCLUDED.started_at < conversations.started_at THEN EXCLUDED.user_id
                    ELSE conversations.user_id
                END,
                started_at = LEAST(conversations.started_at, EXCLUDED.started_at),
                last_message_at = GREATEST(conversations.last_message_at, EXCLUDED.last_message_at),
                message_count = conversations.message_count + 1,
                user_message_count = conversations.user_message_count + EXCLUDED.user_message_count,
                api_cost_usd = conversations.api_cost_usd + EXCLUDED.api_cost_usd,
                processing_cost_usd = conversations.processing_cost_usd + EXCLUDED.processing_cost_usd,
                duration_minutes = GREATEST(conversations.duration_minutes, EXCLUDED.duration_minutes),
                observed_outcomes = ARRAY(
                    SELECT DISTINCT o
                    FROM unnest(conversations.observed_outcomes || EXCLUDED.observed_outcomes) AS o
                    ORDER BY o
                ),
                updated_at = now()
            "#,
        )
        .bind(conversation_id)
        .bind(message.tenant_id)
        .bind(&key)
        .bind(message.user_id)
        .bind(message.created_at)
        .bind(i32::from(message.is_from_user))
        .bind(message.api_cost_usd.clone().unwrap_or_else(BigDecimal::zero))
        .bind(message.processing_cost_usd.clone().unwrap_or_else(BigDecimal::zero))
        .bind(context_duration_minutes(message.conversation_context.as_ref()))
        .bind(&outcomes)
        .execute(&mut *tx)
        .await
        .context("upserting conversation")?;

        // Step 3: Link the message to its conversation
        sqlx::query("UPDATE conversation_history SET conversation_id = $1 WHERE id = $2")
            .bind(conversation_id)
            .bind(message.id)
            .execute(&mut *tx)
            .await
            .context("linking message to conversation")?;

        tx.commit().await.map_err(AppError::DatabaseError)?;

        tracing::debug!(
            "Ingested message {} into conversation {} (session '{}')",
            message.id,
            conversation_id,
            key
        );

        Ok(IngestResponse {
            message_id: message.id,
            conversation_id,
            session_key: key,
            duplicate: false,
        })
    }

    /// Recompute a tenant's conversations from its full message history.
    ///
    /// Conversations are replaced (not incremented), every message is relinked,
    /// and conversations no message points to any more are removed.
    pub async fn rebuild_conversations(&self, tenant_id: Uuid) -> Result<usize, AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        lock_tenant_conversations(&mut tx, tenant_id).await?;

        let messages = sqlx::query_as::<_, ConversationMessage>(
            r#"
            SELECT id, tenant_id, user_id, content, is_from_user, conversation_context,
                   conversation_outcome, confidence_score, api_cost_usd, processing_cost_usd,
                   created_at, conversation_id
            FROM conversation_history
            WHERE tenant_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&mut *tx)
        .await
        .context("loading message history")?;

        let conversations = aggregate_sessions(&messages);

        for conversation in &conversations {
            replace_conversation(&mut tx, conversation).await?;
        }

        // Relink every message in one statement
        let (message_ids, conversation_ids): (Vec<Uuid>, Vec<Uuid>) = messages
            .iter()
            .map(|m| {
                let key = session_key(m.conversation_context.as_ref(), m.id);
                (m.id, conversation_id(m.tenant_id, &key))
            })
            .unzip();

        sqlx::query(
            r#"
            UPDATE conversation_history h
            SET conversation_id = m.conversation_id
            FROM UNNEST($1::uuid[], $2::uuid[]) AS m(message_id, conversation_id)
            WHERE h.id = m.message_id
              AND h.conversation_id IS DISTINCT FROM m.conversation_id
            "#,
        )
        .bind(&message_ids)
        .bind(&conversation_ids)
        .execute(&mut *tx)
        .await
        .context("relinking messages")?;

        let kept: Vec<Uuid> = conversations.iter().map(|c| c.id).collect();
        let removed = sqlx::query(
            "DELETE FROM conversations WHERE tenant_id = $1 AND NOT (id = ANY($2))",
        )
        .bind(tenant_id)
        .bind(&kept)
        .execute(&mut *tx)
        .await
        .context("removing stale conversations")?
        .rows_affected();

        tx.commit().await.map_err(AppError::DatabaseError)?;

        tracing::info!(
            "Rebuilt {} conversations from {} messages for tenant {} ({} stale removed)",
            conversations.len(),
            messages.len(),
            tenant_id,
            removed
        );

        Ok(conversations.len())
    }

    pub async fn tenant_snapshots(
        &self,
        tenant_id: Uuid,
        period: &MetricPeriod,
    ) -> Result<Vec<TenantMetricSnapshot>, AppError> {
        sqlx::query_as::<_, TenantMetricSnapshot>(
            r#"
            SELECT id, tenant_id, period_start, period_end, metric_type, metric_data,
                   payload_checksum, calculated_at
            FROM tenant_metrics
            WHERE tenant_id = $1 AND period_start = $2 AND period_end = $3
            ORDER BY metric_type
            "#,
        )
        .bind(tenant_id)
        .bind(period.start)
        .bind(period.end)
        .fetch_all(&self.pool)
        .await
        .context("loading tenant snapshots")
    }

    /// Every tenant's snapshot of one metric type for a period.
    pub async fn snapshots_of_type(
        &self,
        period: &MetricPeriod,
        metric_type: MetricType,
    ) -> Result<Vec<TenantMetricSnapshot>, AppError> {
        sqlx::query_as::<_, TenantMetricSnapshot>(
            r#"
            SELECT id, tenant_id, period_start, period_end, metric_type, metric_data,
                   payload_checksum, calculated_at
            FROM tenant_metrics
            WHERE period_start = $1 AND period_end = $2 AND metric_type = $3
            ORDER BY tenant_id
            "#,
        )
        .bind(period.start)
        .bind(period.end)
        .bind(metric_type.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading {} snapshots", metric_type))
    }

    /// All snapshots of a period, every tenant and metric type.
    pub async fn period_snapshots(
        &self,
        period: &MetricPeriod,
    ) -> Result<Vec<TenantMetricSnapshot>, AppError> {
        sqlx::query_as::<_, TenantMetricSnapshot>(
            r#"
            SELECT id, tenant_id, period_start, period_end, metric_type, metric_data,
                   payload_checksum, calculated_at
            FROM tenant_metrics
            WHERE period_start = $1 AND period_end = $2
            ORDER BY tenant_id, metric_type
            "#,
        )
        .bind(period.start)
        .bind(period.end)
        .fetch_all(&self.pool)
        .await
        .context("loading period snapshots")
    }

    pub async fn platform_snapshot(
        &self,
        period: &MetricPeriod,
    ) -> Result<Option<PlatformMetricSnapshot>, AppError> {
        sqlx::query_as::<_, PlatformMetricSnapshot>(
            r#"
            SELECT id, period_start, period_end, calculation_date, tenants_included,
                   total_revenue, total_conversations, mrr, metric_data, payload_checksum,
                   calculated_at
            FROM platform_metrics
            WHERE period_start = $1 AND period_end = $2
            "#,
        )
        .bind(period.start)
        .bind(period.end)
        .fetch_optional(&self.pool)
        .await
        .context("loading platform snapshot")
    }

    /// Distinct conversations referenced by message history, per tenant, for
    /// conversations started in the period.
    pub async fn distinct_conversations_per_tenant(
        &self,
        period: &MetricPeriod,
    ) -> Result<HashMap<Uuid, u64>, AppError> {
        let (from, until) = period.utc_bounds();
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT c.tenant_id, COUNT(DISTINCT h.conversation_id)
            FROM conversation_history h
            JOIN conversations c ON c.id = h.conversation_id
            WHERE c.started_at >= $1 AND c.started_at < $2
            GROUP BY c.tenant_id
            "#,
        )
        .bind(from)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .context("counting distinct conversations")?;

        Ok(rows
            .into_iter()
            .map(|(tenant_id, count)| (tenant_id, count.max(0) as u64))
            .collect())
    }

    /// Messages in the period that were never linked to a conversation.
    pub async fn unlinked_message_count(&self, period: &MetricPeriod) -> Result<u64, AppError> {
        let (from, until) = period.utc_bounds();
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM conversation_history
            WHERE conversation_id IS NULL AND created_at >= $1 AND created_at < $2
            "#,
        )
        .bind(from)
        .bind(until)
        .fetch_one(&self.pool)
        .await
        .context("counting unlinked messages")?;

        Ok(count.max(0) as u64)
    }
}

// ============ Loaders shared by pool and transaction callers ============

/// Tenants ordered by signup. Cancelled tenants are dropped unless
/// `include_cancelled`; status is matched after parsing, so stored spellings
/// like `Cancelled` or ` canceled` are excluded as well.
pub async fn fetch_tenants<'e, E>(executor: E, include_cancelled: bool) -> Result<Vec<Tenant>, AppError>
where
    E: PgExecutor<'e>,
{
    let mut tenants = sqlx::query_as::<_, Tenant>(
        r#"
        SELECT id, business_name, domain, subscription_plan, monthly_subscription_fee,
               status, created_at, trial_ends_at
        FROM tenants
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .fetch_all(executor)
    .await
    .context("loading tenants")?;

    if !include_cancelled {
        tenants.retain(|tenant| !tenant.is_cancelled());
    }
    Ok(tenants)
}

pub async fn fetch_appointments<'e, E>(
    executor: E,
    period: &MetricPeriod,
) -> Result<Vec<Appointment>, AppError>
where
    E: PgExecutor<'e>,
{
    let (from, until) = period.utc_bounds();
    sqlx::query_as::<_, Appointment>(
        r#"
        SELECT id, tenant_id, user_id, status, quoted_price, final_price, start_time, source
        FROM appointments
        WHERE start_time >= $1 AND start_time < $2
        ORDER BY start_time ASC, id ASC
        "#,
    )
    .bind(from)
    .bind(until)
    .fetch_all(executor)
    .await
    .context("loading appointments")
}

pub async fn fetch_conversations<'e, E>(
    executor: E,
    period: &MetricPeriod,
) -> Result<Vec<Conversation>, AppError>
where
    E: PgExecutor<'e>,
{
    let (from, until) = period.utc_bounds();
    sqlx::query_as::<_, Conversation>(
        r#"
        SELECT id, tenant_id, session_key, user_id, started_at, last_message_at,
               message_count, user_message_count, api_cost_usd, processing_cost_usd,
               duration_minutes, observed_outcomes
        FROM conversations
        WHERE started_at >= $1 AND started_at < $2
        ORDER BY started_at ASC, id ASC
        "#,
    )
    .bind(from)
    .bind(until)
    .fetch_all(executor)
    .await
    .context("loading conversations")
}

pub async fn fetch_payments<'e, E>(
    executor: E,
    period: &MetricPeriod,
) -> Result<Vec<SubscriptionPayment>, AppError>
where
    E: PgExecutor<'e>,
{
    let (from, until) = period.utc_bounds();
    sqlx::query_as::<_, SubscriptionPayment>(
        r#"
        SELECT id, tenant_id, amount, payment_date, payment_status
        FROM subscription_payments
        WHERE payment_date >= $1 AND payment_date < $2
        ORDER BY payment_date ASC, id ASC
        "#,
    )
    .bind(from)
    .bind(until)
    .fetch_all(executor)
    .await
    .context("loading subscription payments")
}

// ============ Snapshot upserts ============

/// Upsert one (tenant, period, metric type) snapshot.
///
/// Keyed by the `tenant_metrics_unique_snapshot` constraint. A payload whose
/// checksum matches the stored one leaves the row (and its `calculated_at`)
/// untouched.
pub async fn upsert_tenant_snapshot(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    period: &MetricPeriod,
    metric_type: MetricType,
    payload: &serde_json::Value,
) -> Result<UpsertOutcome, AppError> {
    let checksum = payload_checksum(payload);

    let affected = sqlx::query(
        r#"
        INSERT INTO tenant_metrics (
            tenant_id, period_start, period_end, metric_type, metric_data,
            payload_checksum, calculated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, now())
        ON CONFLICT ON CONSTRAINT tenant_metrics_unique_snapshot DO UPDATE
        SET metric_data = EXCLUDED.metric_data,
            payload_checksum = EXCLUDED.payload_checksum,
            calculated_at = EXCLUDED.calculated_at
        WHERE tenant_metrics.payload_checksum IS DISTINCT FROM EXCLUDED.payload_checksum
        "#,
    )
    .bind(tenant_id)
    .bind(period.start)
    .bind(period.end)
    .bind(metric_type.as_str())
    .bind(payload)
    .bind(&checksum)
    .execute(conn)
    .await
    .with_context(|| format!("upserting {} snapshot for tenant {}", metric_type, tenant_id))?
    .rows_affected();

    Ok(if affected == 0 {
        UpsertOutcome::Unchanged
    } else {
        UpsertOutcome::Written
    })
}

/// Delete the period's snapshots of tenants outside `keep`, such as tenants
/// cancelled since the last run. Returns the number of rows removed.
pub async fn delete_stale_tenant_snapshots(
    conn: &mut PgConnection,
    period: &MetricPeriod,
    keep: &[Uuid],
) -> Result<u64, AppError> {
    let removed = sqlx::query(
        r#"
        DELETE FROM tenant_metrics
        WHERE period_start = $1 AND period_end = $2 AND NOT (tenant_id = ANY($3))
        "#,
    )
    .bind(period.start)
    .bind(period.end)
    .bind(keep)
    .execute(conn)
    .await
    .with_context(|| format!("removing stale snapshots of {}", period))?
    .rows_affected();

    Ok(removed)
}

/// Upsert the platform rollup of a period, keyed by `platform_metrics_unique_period`.
pub async fn upsert_platform_snapshot(
    conn: &mut PgConnection,
    metrics: &PlatformMetrics,
    calculation_date: NaiveDate,
) -> Result<UpsertOutcome, AppError> {
    let payload = serde_json::to_value(metrics)?;
    let checksum = payload_checksum(&payload);

    let affected = sqlx::query(
        r#"
        INSERT INTO platform_metrics (
            period_start, period_end, calculation_date, tenants_included, total_revenue,
            total_conversations, mrr, metric_data, payload_checksum, calculated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
        ON CONFLICT ON CONSTRAINT platform_metrics_unique_period DO UPDATE
        SET calculation_date = EXCLUDED.calculation_date,
            tenants_included = EXCLUDED.tenants_included,
            total_revenue = EXCLUDED.total_revenue,
            total_conversations = EXCLUDED.total_conversations,
            mrr = EXCLUDED.mrr,
            metric_data = EXCLUDED.metric_data,
            payload_checksum = EXCLUDED.payload_checksum,
            calculated_at = EXCLUDED.calculated_at
        WHERE platform_metrics.payload_checksum IS DISTINCT FROM EXCLUDED.payload_checksum
        "#,
    )
    .bind(metrics.period.start)
    .bind(metrics.period.end)
    .bind(calculation_date)
    .bind(i32::try_from(metrics.tenants_included).unwrap_or(i32::MAX))
    .bind(&metrics.total_revenue)
    .bind(i64::try_from(metrics.total_conversations).unwrap_or(i64::MAX))
    .bind(&metrics.mrr)
    .bind(&payload)
    .bind(&checksum)
    .execute(conn)
    .await
    .context("upserting platform snapshot")?
    .rows_affected();

    Ok(if affected == 0 {
        UpsertOutcome::Unchanged
    } else {
        UpsertOutcome::Written
    })
}

/// Serialize conversation writes of one tenant until the transaction ends.
async fn lock_tenant_conversations(conn: &mut PgConnection, tenant_id: Uuid) -> Result<(), AppError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("conversations:{}", tenant_id))
        .execute(conn)
        .await
        .context("acquiring tenant conversation lock")?;
    Ok(())
}

/// Write a conversation with replace semantics (used by rebuilds).
async fn replace_conversation(
    conn: &mut PgConnection,
    conversation: &Conversation,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO conversations (
            id, tenant_id, session_key, user_id, started_at, last_message_at,
            message_count, user_message_count, api_cost_usd, processing_cost_usd,
            duration_minutes, observed_outcomes, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now())
        ON CONFLICT (id) DO UPDATE
        SET user_id = EXCLUDED.user_id,
            started_at = EXCLUDED.started_at,
            last_message_at = EXCLUDED.last_message_at,
            message_count = EXCLUDED.message_count,
            user_message_count = EXCLUDED.user_message_count,
            api_cost_usd = EXCLUDED.api_cost_usd,
            processing_cost_usd = EXCLUDED.processing_cost_usd,
            duration_minutes = EXCLUDED.duration_minutes,
            observed_outcomes = EXCLUDED.observed_outcomes,
            updated_at = now()
        "#,
    )
    .bind(conversation.id)
    .bind(conversation.tenant_id)
    .bind(&conversation.session_key)
    .bind(conversation.user_id)
    .bind(conversation.started_at)
    .bind(conversation.last_message_at)
    .bind(conversation.message_count)
    .bind(conversation.user_message_count)
    .bind(&conversation.api_cost_usd)
    .bind(&conversation.processing_cost_usd)
    .bind(conversation.duration_minutes)
    .bind(&conversation.observed_outcomes)
    .execute(conn)
    .await
    .with_context(|| format!("writing conversation {}", conversation.id))?;

    Ok(())
}
