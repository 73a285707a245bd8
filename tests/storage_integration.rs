use chrono::{TimeZone, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::env;
use uuid::Uuid;

use tenant_metrics::consistency::CHECK_CONVERSATION_COUNTS;
use tenant_metrics::data::db::Database;
use tenant_metrics::errors::AppError;
use tenant_metrics::metrics::MetricType;
use tenant_metrics::metrics_storage::fetch_tenants;
use tenant_metrics::models::NewConversationMessage;
use tenant_metrics::period::MetricPeriod;
use tenant_metrics::services::MetricsService;

/// Tests share one database and recalculate every active tenant, so they run one at a time.
static DB_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Integration tests against a real Postgres.
/// Marked ignored to avoid running against production by accident; set TEST_DATABASE_URL to run.
async fn connect() -> anyhow::Result<Database> {
    let db_url = env::var("TEST_DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL to run this test"))?;
    let db = Database::new(&db_url, 5).await?;
    db.migrate().await?;
    Ok(db)
}

async fn insert_tenant(pool: &PgPool, status: &str, plan: &str, fee: &str) -> anyhow::Result<Uuid> {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO tenants (business_name, subscription_plan, monthly_subscription_fee, status)
        VALUES ($1, $2, $3::numeric, $4)
        RETURNING id
        "#,
    )
    .bind(format!("Test Tenant {}", Uuid::new_v4()))
    .bind(plan)
    .bind(fee)
    .bind(status)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

async fn insert_completed_appointment(
    pool: &PgPool,
    tenant_id: Uuid,
    price: &str,
    month: u32,
    day: u32,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO appointments (tenant_id, user_id, status, quoted_price, start_time)
        VALUES ($1, $2, 'completed', $3::numeric, $4)
        "#,
    )
    .bind(tenant_id)
    .bind(Uuid::new_v4())
    .bind(price)
    .bind(Utc.with_ymd_and_hms(2030, month, day, 14, 0, 0).unwrap())
    .execute(pool)
    .await?;
    Ok(())
}

fn new_message(tenant_id: Uuid, session: &str, day: u32, month: u32) -> NewConversationMessage {
    NewConversationMessage {
        id: Some(Uuid::new_v4()),
        tenant_id,
        user_id: Uuid::new_v4(),
        content: "Quero marcar um corte".to_string(),
        is_from_user: true,
        conversation_context: Some(json!({ "session_id": session })),
        conversation_outcome: None,
        confidence_score: None,
        api_cost_usd: None,
        processing_cost_usd: None,
        created_at: Some(Utc.with_ymd_and_hms(2030, month, day, 10, 0, 0).unwrap()),
    }
}

#[tokio::test]
#[ignore]
async fn ingesting_the_same_message_twice_counts_once() -> anyhow::Result<()> {
    let _serial = DB_LOCK.lock().await;
    let db = connect().await?;
    let service = MetricsService::new(db.pool.clone());
    // Cancelled, so concurrent recalculations never pick this tenant up
    let tenant_id = insert_tenant(&db.pool, "cancelled", "basic", "58.00").await?;

    let message = new_message(tenant_id, "wa-1", 3, 1);
    let first = service.storage().ingest_message(message.clone()).await?;
    let replay = service.storage().ingest_message(message).await?;
    service
        .storage()
        .ingest_message(new_message(tenant_id, "wa-1", 3, 1))
        .await?;

    assert!(!first.duplicate);
    assert!(replay.duplicate);
    assert_eq!(first.conversation_id, replay.conversation_id);

    let (count,): (i32,) = sqlx::query_as("SELECT message_count FROM conversations WHERE id = $1")
        .bind(first.conversation_id)
        .fetch_one(&db.pool)
        .await?;
    assert_eq!(count, 2);

    // A rebuild reproduces what ingestion maintained incrementally
    let rebuilt = service.storage().rebuild_conversations(tenant_id).await?;
    assert_eq!(rebuilt, 1);

    Ok(())
}

#[tokio::test]
#[ignore]
async fn rerunning_a_recalculation_leaves_snapshots_unchanged() -> anyhow::Result<()> {
    let _serial = DB_LOCK.lock().await;
    let db = connect().await?;
    let service = MetricsService::new(db.pool.clone());
    let period = MetricPeriod::month(2030, 2)?;
    let tenant_id = insert_tenant(&db.pool, "active", "profissional", "116.00").await?;

    sqlx::query(
        r#"
        INSERT INTO appointments (tenant_id, user_id, status, quoted_price, start_time)
        VALUES ($1, $2, 'completed', 150.00, $3)
        "#,
    )
    .bind(tenant_id)
    .bind(Uuid::new_v4())
    .bind(Utc.with_ymd_and_hms(2030, 2, 10, 14, 0, 0).unwrap())
    .execute(&db.pool)
    .await?;
    service
        .storage()
        .ingest_message(new_message(tenant_id, "wa-9", 10, 2))
        .await?;

    let first = service.recalculate(&period).await?;
    assert!(first.snapshots_written >= MetricType::ALL.len());

    let second = service.recalculate(&period).await?;
    assert_eq!(second.snapshots_written, 0);
    assert!(!second.platform_written);
    assert_eq!(first.total_revenue, second.total_revenue);

    let stored = service.tenant_snapshots(tenant_id, &period).await?;
    assert_eq!(stored.snapshots.len(), MetricType::ALL.len());

    let report = service.check_consistency(&period).await?;
    assert!(
        report.is_consistent(),
        "{:?}",
        report.violations().collect::<Vec<_>>()
    );

    Ok(())
}

#[tokio::test]
#[ignore]
async fn ingesting_for_an_unknown_tenant_is_not_found() -> anyhow::Result<()> {
    let _serial = DB_LOCK.lock().await;
    let db = connect().await?;
    let service = MetricsService::new(db.pool.clone());
    let message = new_message(Uuid::new_v4(), "wa-ghost", 3, 1);
    let message_id = message.id;

    let Err(err) = service.storage().ingest_message(message).await else {
        anyhow::bail!("message for an unknown tenant was stored");
    };
    assert!(matches!(err.root(), AppError::NotFound(_)), "{}", err);
    assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);

    let (stored,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conversation_history WHERE id = $1")
        .bind(message_id)
        .fetch_one(&db.pool)
        .await?;
    assert_eq!(stored, 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn ingest_racing_a_rebuild_keeps_counts_in_step_with_history() -> anyhow::Result<()> {
    let _serial = DB_LOCK.lock().await;
    let db = connect().await?;
    let service = MetricsService::new(db.pool.clone());
    let tenant_id = insert_tenant(&db.pool, "cancelled", "basic", "58.00").await?;

    for day in 1..=5 {
        service
            .storage()
            .ingest_message(new_message(tenant_id, "wa-race", day, 1))
            .await?;
    }

    for day in 6..=10 {
        let storage = service.storage();
        let (ingested, rebuilt) = tokio::join!(
            storage.ingest_message(new_message(tenant_id, "wa-race", day, 1)),
            storage.rebuild_conversations(tenant_id),
        );
        ingested?;
        rebuilt?;
    }

    let (message_count, linked): (i32, i64) = sqlx::query_as(
        r#"
        SELECT c.message_count,
               (SELECT COUNT(*) FROM conversation_history h WHERE h.conversation_id = c.id)
        FROM conversations c
        WHERE c.tenant_id = $1
        "#,
    )
    .bind(tenant_id)
    .fetch_one(&db.pool)
    .await?;
    assert_eq!(message_count, 10);
    assert_eq!(linked, 10);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn concurrent_recalculations_of_one_period_both_succeed() -> anyhow::Result<()> {
    let _serial = DB_LOCK.lock().await;
    let db = connect().await?;
    let service = MetricsService::new(db.pool.clone());
    let period = MetricPeriod::month(2030, 5)?;
    let tenant_id = insert_tenant(&db.pool, "active", "basic", "58.00").await?;
    insert_completed_appointment(&db.pool, tenant_id, "80.00", 5, 12).await?;
    service
        .storage()
        .ingest_message(new_message(tenant_id, "wa-5", 12, 5))
        .await?;

    let (first, second) = tokio::join!(service.recalculate(&period), service.recalculate(&period));
    let (first, second) = (first?, second?);
    assert_eq!(first.total_revenue, second.total_revenue);
    assert_eq!(first.tenants, second.tenants);
    // Serialized by the period lock: whichever ran second found nothing to write
    assert_eq!(first.snapshots_written.min(second.snapshots_written), 0);

    let stored = service.tenant_snapshots(tenant_id, &period).await?;
    assert_eq!(stored.snapshots.len(), MetricType::ALL.len());

    let report = service.check_consistency(&period).await?;
    assert!(
        report.is_consistent(),
        "{:?}",
        report.violations().collect::<Vec<_>>()
    );

    Ok(())
}

#[tokio::test]
#[ignore]
async fn cancelling_a_tenant_removes_its_snapshots_on_the_next_run() -> anyhow::Result<()> {
    let _serial = DB_LOCK.lock().await;
    let db = connect().await?;
    let service = MetricsService::new(db.pool.clone());
    let period = MetricPeriod::month(2030, 3)?;
    let staying = insert_tenant(&db.pool, "active", "basic", "58.00").await?;
    let leaving = insert_tenant(&db.pool, "active", "basic", "58.00").await?;
    insert_completed_appointment(&db.pool, staying, "100.00", 3, 4).await?;
    insert_completed_appointment(&db.pool, leaving, "100.00", 3, 5).await?;

    let before = service.recalculate(&period).await?;
    assert_eq!(
        service.tenant_snapshots(leaving, &period).await?.snapshots.len(),
        MetricType::ALL.len()
    );

    sqlx::query("UPDATE tenants SET status = 'cancelled' WHERE id = $1")
        .bind(leaving)
        .execute(&db.pool)
        .await?;
    let after = service.recalculate(&period).await?;

    assert_eq!(after.snapshots_removed, MetricType::ALL.len() as u64);
    assert_eq!(after.tenants, before.tenants - 1);
    assert_eq!(
        after.total_revenue,
        before.total_revenue - bigdecimal::BigDecimal::from(100)
    );
    assert!(service.tenant_snapshots(leaving, &period).await?.snapshots.is_empty());

    let report = service.check_consistency(&period).await?;
    assert!(
        report.is_consistent(),
        "{:?}",
        report.violations().collect::<Vec<_>>()
    );

    Ok(())
}

#[tokio::test]
#[ignore]
async fn cancelled_status_spellings_are_left_out_of_the_rollup() -> anyhow::Result<()> {
    let _serial = DB_LOCK.lock().await;
    let db = connect().await?;
    let service = MetricsService::new(db.pool.clone());
    let period = MetricPeriod::month(2030, 6)?;
    let capitalised = insert_tenant(&db.pool, "Cancelled", "basic", "58.00").await?;
    let padded = insert_tenant(&db.pool, " canceled", "basic", "58.00").await?;
    insert_completed_appointment(&db.pool, capitalised, "70.00", 6, 3).await?;

    let active: Vec<Uuid> = fetch_tenants(&db.pool, false).await?.into_iter().map(|t| t.id).collect();
    assert!(!active.contains(&capitalised));
    assert!(!active.contains(&padded));
    let all: Vec<Uuid> = fetch_tenants(&db.pool, true).await?.into_iter().map(|t| t.id).collect();
    assert!(all.contains(&capitalised) && all.contains(&padded));

    let summary = service.recalculate(&period).await?;
    assert_eq!(summary.tenants, active.len());
    assert!(service.tenant_snapshots(capitalised, &period).await?.snapshots.is_empty());
    assert!(service.tenant_snapshots(padded, &period).await?.snapshots.is_empty());

    Ok(())
}

#[tokio::test]
#[ignore]
async fn history_drifting_from_snapshots_is_reported() -> anyhow::Result<()> {
    let _serial = DB_LOCK.lock().await;
    let db = connect().await?;
    let service = MetricsService::new(db.pool.clone());
    let period = MetricPeriod::month(2030, 4)?;
    let tenant_id = insert_tenant(&db.pool, "active", "basic", "58.00").await?;
    let first = service
        .storage()
        .ingest_message(new_message(tenant_id, "wa-a", 5, 4))
        .await?;

    service.recalculate(&period).await?;
    assert!(service.check_consistency(&period).await?.is_consistent());

    // New history after the run: stored count is now stale
    service
        .storage()
        .ingest_message(new_message(tenant_id, "wa-b", 6, 4))
        .await?;
    let report = service.check_consistency(&period).await?;
    assert!(report
        .violations()
        .any(|(check, violation)| check == CHECK_CONVERSATION_COUNTS
            && violation.contains(&tenant_id.to_string())));

    service.recalculate(&period).await?;
    assert!(service.check_consistency(&period).await?.is_consistent());

    // Moving a conversation out of the period by hand drifts it again
    sqlx::query("UPDATE conversations SET started_at = started_at - interval '400 days' WHERE id = $1")
        .bind(first.conversation_id)
        .execute(&db.pool)
        .await?;
    let report = service.check_consistency(&period).await?;
    assert!(report
        .violations()
        .any(|(check, violation)| check == CHECK_CONVERSATION_COUNTS
            && violation.contains(&tenant_id.to_string())));

    Ok(())
}
