//! Internal analysis image repository implementation.

use async_trait::async_trait;
use sqlx::{postgres::PgRow, Pool, Postgres, Row};

use nsweb_core::{Error, Image, ImageRepository, Result};

/// PostgreSQL implementation of ImageRepository.
pub struct PgImageRepository {
    pool: Pool<Postgres>,
}

impl PgImageRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImageRepository for PgImageRepository {
    async fn get(&self, id: i64) -> Result<Option<Image>> {
        let row = sqlx::query("SELECT id, name, label, image_file, display FROM image WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(|r| image_from_row(&r)))
    }

    async fn images_at_location(&self, x: i32, y: i32, z: i32) -> Result<Vec<Image>> {
        let rows = sqlx::query(
            r#"
            SELECT i.id, i.name, i.label, i.image_file, i.display
            FROM location l
            JOIN location_image li ON li.location_id = l.id
            JOIN image i ON i.id = li.image_id
            WHERE l.x = $1 AND l.y = $2 AND l.z = $3 AND i.display
            ORDER BY i.id
            "#,
        )
        .bind(x)
        .bind(y)
        .bind(z)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.iter().map(image_from_row).collect())
    }
}

fn image_from_row(row: &PgRow) -> Image {
    Image {
        id: row.get("id"),
        name: row.get("name"),
        label: row.get("label"),
        image_file: row.get("image_file"),
        display: row.get("display"),
    }
}
