//! One-shot recalculation of tenant and platform metrics.
//!
//! Usage: `recalculate_metrics [PERIOD]` where PERIOD is `YYYY-MM`,
//! `YYYY-MM-DD..YYYY-MM-DD` or `<N>d`. Defaults to the current month.

use chrono::Utc;
use dotenvy::dotenv;
use tenant_metrics::config::Config;
use tenant_metrics::db::Database;
use tenant_metrics::period::MetricPeriod;
use tenant_metrics::services::MetricsService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let today = Utc::now().date_naive();
    let period = match std::env::args().nth(1) {
        Some(raw) => MetricPeriod::parse(&raw, today)?,
        None => MetricPeriod::current_month(today),
    };

    let config = Config::from_env()?;
    let db = Database::new(&config.database_url, 5).await?;
    db.migrate().await?;

    let service = MetricsService::new(db.pool.clone());
    let summary = service.recalculate(&period).await?;

    println!("Period:              {} ({})", summary.period_key, summary.period);
    println!("Tenants:             {}", summary.tenants);
    println!("Snapshots written:   {}", summary.snapshots_written);
    println!("Snapshots unchanged: {}", summary.snapshots_unchanged);
    println!("Snapshots removed:   {}", summary.snapshots_removed);
    println!("Platform written:    {}", summary.platform_written);
    println!("Total revenue:       {}", summary.total_revenue);
    println!("Conversations:       {}", summary.total_conversations);
    println!("Elapsed:             {} ms", summary.elapsed_ms);

    Ok(())
}
