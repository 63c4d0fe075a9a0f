//! # nsweb-db
//!
//! Storage layer for the nsweb decoding service.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL repositories for decodings, reference sets, peaks and images
//! - The filesystem artifact store (source images, result tables, scatterplots)
//! - An in-memory store implementing the same traits
//!
//! ## Example
//!
//! ```rust,ignore
//! use nsweb_db::{Database, DecodingRepository};
//!
//! let db = Database::connect("postgres://localhost/nsweb").await?;
//! let decoding = db.decodings.get_by_uuid("0f3c...").await?;
//! ```
pub mod artifacts;
pub mod decoding_sets;
pub mod decodings;
pub mod images;
pub mod memory;
pub mod peaks;
pub mod pool;

// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

pub use nsweb_core::*;

pub use artifacts::{write_atomic, ArtifactStore, FilesystemBackend, StorageBackend};
pub use decoding_sets::PgDecodingSetRepository;
pub use decodings::PgDecodingRepository;
pub use images::PgImageRepository;
pub use memory::MemoryStore;
pub use peaks::PgPeakRepository;
pub use pool::{open_pool, PoolConfig};

/// Combined database context with all repositories.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Decoding registry.
    pub decodings: PgDecodingRepository,
    /// Reference sets.
    pub decoding_sets: PgDecodingSetRepository,
    /// Spatial peak queries.
    pub peaks: PgPeakRepository,
    /// Internal analysis images.
    pub images: PgImageRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            decodings: PgDecodingRepository::new(pool.clone()),
            decoding_sets: PgDecodingSetRepository::new(pool.clone()),
            peaks: PgPeakRepository::new(pool.clone()),
            images: PgImageRepository::new(pool.clone()),
            pool,
        }
    }

    /// Connect using pool limits from the environment.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::from_env()).await
    }

    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = open_pool(url, &config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
