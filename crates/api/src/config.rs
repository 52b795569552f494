//! Process configuration, read once from the environment.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use engage_infra::invoicing::GenerationJobConfig;
use engage_infra::jobs::JobExecutorConfig;

pub const DEV_JWT_SECRET: &str = "dev-secret";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub jwt_secret: String,
    pub bind_addr: SocketAddr,
    /// Postgres event store and Redis bus instead of the in-memory pair.
    pub persistent: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub generation: GenerationJobConfig,
    pub executor: JobExecutorConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            persistent: false,
            database_url: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            generation: GenerationJobConfig::default(),
            executor: JobExecutorConfig::default().with_name("invoice-jobs"),
        }
    }
}

impl ApiConfig {
    /// Load `.env` when present, then read the process environment. Unset or
    /// unparsable values fall back to their defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| {
            tracing::warn!("JWT_SECRET not set; using insecure dev default");
            DEV_JWT_SECRET.to_string()
        });

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("BIND_ADDR '{bind_addr}' is not a socket address: {e}"))?;

        let persistent = parsed("USE_PERSISTENT_STORES").unwrap_or(false);
        let database_url = env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty());
        if persistent && database_url.is_none() {
            anyhow::bail!("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");
        }

        let generation = GenerationJobConfig {
            max_attempts: parsed("INVOICE_JOB_MAX_ATTEMPTS").unwrap_or(defaults.generation.max_attempts),
            backoff: parsed("INVOICE_JOB_BACKOFF_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.generation.backoff),
        };

        let mut executor = defaults.executor;
        if let Some(ms) = parsed::<u64>("JOB_POLL_INTERVAL_MS") {
            executor = executor.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(max) = parsed::<usize>("JOB_MAX_CONCURRENT") {
            executor = executor.with_max_concurrent(max);
        }

        Ok(Self {
            jwt_secret,
            bind_addr,
            persistent,
            database_url,
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            generation,
            executor,
        })
    }

    /// In-memory stores and a fast executor, for tests and local tools.
    pub fn in_memory(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            generation: GenerationJobConfig { max_attempts: 3, backoff: Duration::ZERO },
            executor: JobExecutorConfig::default()
                .with_name("invoice-jobs")
                .with_poll_interval(Duration::from_millis(20)),
            ..Self::default()
        }
    }
}

fn parsed<T: FromStr>(var: &str) -> Option<T> {
    let raw = env::var(var).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_config_retries_without_waiting() {
        let config = ApiConfig::in_memory("s3cret");
        assert_eq!(config.jwt_secret, "s3cret");
        assert!(!config.persistent);
        assert_eq!(config.generation.backoff, Duration::ZERO);
        assert_eq!(config.generation.max_attempts, 3);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ApiConfig::default();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.generation.backoff, Duration::from_secs(60));
        assert_eq!(config.executor.max_concurrent, 4);
        assert_eq!(config.executor.poll_interval, Duration::from_millis(100));
    }
}
