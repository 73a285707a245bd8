//! Runs the metric consistency checks for one period.
//!
//! Exits with status 1 when any check fails, so it can gate CI or cron jobs.

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

    let service = MetricsService::new(db.pool.clone());
    let report = service.check_consistency(&period).await?;

    println!("Consistency report for {}", report.period_key);
    for check in &report.checks {
        let mark = if check.passed { "ok  " } else { "FAIL" };
        println!("[{}] {} ({})", mark, check.name, check.detail);
        for violation in &check.violations {
            println!("       - {}", violation);
        }
    }

    if !report.is_consistent() {
        std::process::exit(1);
    }

    Ok(())
}
