//! Postgres pool for the decoding registry.
//!
//! Registry queries are short point lookups and single-row writes; long work
//! (downloads, decoding) never holds a connection. A small pool is enough.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use nsweb_core::{Error, Result};

/// Connection limits for the registry pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a request waits for a free connection.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    /// Overrides from `NSWEB_DB_MAX_CONNECTIONS` and `NSWEB_DB_ACQUIRE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_connections = env_parse("NSWEB_DB_MAX_CONNECTIONS")
            .filter(|n: &u32| *n > 0)
            .unwrap_or(defaults.max_connections);
        let acquire_timeout = env_parse("NSWEB_DB_ACQUIRE_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.acquire_timeout);
        Self {
            max_connections,
            min_connections: defaults.min_connections.min(max_connections),
            acquire_timeout,
            ..defaults
        }
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self.min_connections = self.min_connections.min(n);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Open the registry pool.
pub async fn open_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        max_connections = config.max_connections,
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Registry pool ready"
    );
    Ok(pool)
}
