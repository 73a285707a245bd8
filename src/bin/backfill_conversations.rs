//! Rebuilds first-class conversations from message history.
//!
//! Usage: `backfill_conversations [TENANT_ID]`. Without an id, every tenant
//! (cancelled ones included) is rebuilt.

use dotenvy::dotenv;
use tenant_metrics::config::Config;
use tenant_metrics::db::Database;
use tenant_metrics::metrics_storage::{fetch_tenants, MetricsStorage};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    let db = Database::new(&config.database_url, 5).await?;
    db.migrate().await?;
    let storage = MetricsStorage::new(db.pool.clone());

    let tenant_ids: Vec<Uuid> = match std::env::args().nth(1) {
        Some(raw) => vec![Uuid::parse_str(raw.trim())
            .map_err(|e| anyhow::anyhow!("Invalid tenant id '{}': {}", raw, e))?],
        None => fetch_tenants(storage.pool(), true)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect(),
    };

    tracing::info!("Backfilling conversations for {} tenant(s)", tenant_ids.len());

    let mut total = 0;
    let mut failed = 0;
    for tenant_id in &tenant_ids {
        match storage.rebuild_conversations(*tenant_id).await {
            Ok(count) => {
                tracing::info!("Tenant {}: {} conversations", tenant_id, count);
                total += count;
            }
            Err(e) => {
                tracing::error!("Tenant {}: rebuild failed: {}", tenant_id, e);
                failed += 1;
            }
        }
    }

    println!(
        "Rebuilt {} conversations across {} tenants ({} failed)",
        total,
        tenant_ids.len() - failed,
        failed
    );

    if failed > 0 {
        anyhow::bail!("{} tenant rebuild(s) failed", failed);
    }

    Ok(())
}
