use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub admin_api_key: Option<String>, // Mutating endpoints are open when unset
    pub db_max_connections: u32,
    pub recalc_interval_secs: u64, // 0 disables the background loop
    pub metrics_cache_ttl_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| validate_database_url(&url).map(|_| url))?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            admin_api_key: std::env::var("ADMIN_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            db_max_connections: parse_or_default("DB_MAX_CONNECTIONS", 10)?,
            recalc_interval_secs: parse_or_default("RECALC_INTERVAL_SECS", 0)?,
            metrics_cache_ttl_secs: parse_or_default("METRICS_CACHE_TTL_SECS", 300)?,
        };

        if config.db_max_connections == 0 {
            anyhow::bail!("DB_MAX_CONNECTIONS must be at least 1");
        }

        config.log_loaded();

        Ok(config)
    }

    /// Logs the loaded settings once at startup, without sensitive values.
    fn log_loaded(&self) {
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &self.database_url[..20.min(self.database_url.len())]
        );
        tracing::debug!("Server Port: {}", self.port);
        tracing::debug!("DB max connections: {}", self.db_max_connections);
        if self.admin_api_key.is_none() {
            tracing::warn!("ADMIN_API_KEY not set: mutating endpoints are unauthenticated");
        }
    }
}

/// Rejects blank URLs and anything that is not a Postgres connection string.
pub fn validate_database_url(url: &str) -> anyhow::Result<()> {
    if url.trim().is_empty() {
        anyhow::bail!("DB_URL cannot be empty");
    }
    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
    }
    Ok(())
}

fn parse_or_default<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer", name)),
        _ => Ok(default),
    }
}
