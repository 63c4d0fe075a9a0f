//! Reference set repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use nsweb_core::{DecodingSet, DecodingSetRepository, Error, Result};

/// PostgreSQL implementation of DecodingSetRepository.
pub struct PgDecodingSetRepository {
    pool: Pool<Postgres>,
}

impl PgDecodingSetRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DecodingSetRepository for PgDecodingSetRepository {
    async fn list(&self) -> Result<Vec<DecodingSet>> {
        let rows = sqlx::query(
            "SELECT id, name, description, n_images FROM decoding_set ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| DecodingSet {
                id: row.get("id"),
                name: row.get("name"),
                description: row.get("description"),
                n_images: row.get("n_images"),
            })
            .collect())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<DecodingSet>> {
        let row = sqlx::query(
            "SELECT id, name, description, n_images FROM decoding_set WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| DecodingSet {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            n_images: row.get("n_images"),
        }))
    }
}
