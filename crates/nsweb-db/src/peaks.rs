//! Spatial peak queries backed by PostgreSQL.
//!
//! The bounding-box predicates hit the per-axis indexes; the exact sphere
//! test runs on the surviving rows.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use nsweb_core::{Error, PeakRepository, Result, Study, StudyPeakCount};

/// PostgreSQL implementation of PeakRepository.
pub struct PgPeakRepository {
    pool: Pool<Postgres>,
}

impl PgPeakRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PeakRepository for PgPeakRepository {
    async fn find_nearby(
        &self,
        x: f64,
        y: f64,
        z: f64,
        radius: f64,
    ) -> Result<Vec<StudyPeakCount>> {
        let rows = sqlx::query(
            r#"
            SELECT s.pmid, s.title, s.authors, s.journal, s.year, COUNT(p.id) AS peaks
            FROM peak p
            JOIN study s ON s.pmid = p.pmid
            WHERE p.x BETWEEN $1 - $4 AND $1 + $4
              AND p.y BETWEEN $2 - $4 AND $2 + $4
              AND p.z BETWEEN $3 - $4 AND $3 + $4
              AND (p.x - $1) * (p.x - $1) + (p.y - $2) * (p.y - $2) + (p.z - $3) * (p.z - $3) <= $4 * $4
            GROUP BY s.pmid, s.title, s.authors, s.journal, s.year
            ORDER BY s.pmid
            "#,
        )
        .bind(x)
        .bind(y)
        .bind(z)
        .bind(radius)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "peaks",
            op = "find_nearby",
            result_count = rows.len(),
            "Spatial query complete"
        );

        Ok(rows
            .into_iter()
            .map(|row| StudyPeakCount {
                study: Study {
                    pmid: row.get("pmid"),
                    title: row.get("title"),
                    authors: row.get("authors"),
                    journal: row.get("journal"),
                    year: row.get("year"),
                },
                peaks: row.get("peaks"),
            })
            .collect())
    }
}
