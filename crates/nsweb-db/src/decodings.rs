//! Decoding registry repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use tracing::debug;

use nsweb_core::{
    Claim, Decoding, DecodingIdentity, DecodingRepository, DecodingStatus, Error, NewDecoding,
    Result,
};

const SELECT_DECODING: &str = r#"
    SELECT d.id, d.uuid, d.url, d.neurovault_id, d.image_id, s.name AS set_name,
           d.name, d.display, d.download, d.ip, d.image_modified_at,
           d.image_decoded_at, d.filename, d.status, d.error_message, d.created_at
    FROM decoding d
    JOIN decoding_set s ON s.id = d.decoding_set_id
"#;

/// Attempts before giving up when a conflicting row disappears mid-claim.
const CLAIM_ATTEMPTS: usize = 3;

/// PostgreSQL implementation of DecodingRepository.
pub struct PgDecodingRepository {
    pool: Pool<Postgres>,
}

impl PgDecodingRepository {
    /// Create a new PgDecodingRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn fetch_by_id(&self, id: i64) -> Result<Option<Decoding>> {
        let row = sqlx::query(&format!("{} WHERE d.id = $1", SELECT_DECODING))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(|r| decoding_from_row(&r)).transpose()
    }

    async fn find_by_key(&self, key: &str, set_id: i64) -> Result<Option<Decoding>> {
        let row = sqlx::query(&format!(
            "{} WHERE d.identity_key = $1 AND d.decoding_set_id = $2",
            SELECT_DECODING
        ))
        .bind(key)
        .bind(set_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.map(|r| decoding_from_row(&r)).transpose()
    }
}

#[async_trait]
impl DecodingRepository for PgDecodingRepository {
    async fn find(&self, identity: &DecodingIdentity, set_id: i64) -> Result<Option<Decoding>> {
        self.find_by_key(&identity.key(), set_id).await
    }

    async fn claim(&self, req: NewDecoding) -> Result<Claim> {
        let key = req.identity.key();

        for _ in 0..CLAIM_ATTEMPTS {
            let inserted: Option<i64> = sqlx::query_scalar(
                r#"
                INSERT INTO decoding (
                    uuid, identity_key, url, neurovault_id, image_id, decoding_set_id,
                    name, display, download, ip, image_modified_at, filename, status
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'pending')
                ON CONFLICT (identity_key, decoding_set_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&req.uuid)
            .bind(&key)
            .bind(req.identity.url())
            .bind(req.identity.neurovault_id())
            .bind(req.identity.image_id())
            .bind(req.decoding_set.id)
            .bind(&req.name)
            .bind(req.display)
            .bind(req.download)
            .bind(&req.ip)
            .bind(req.image_modified_at)
            .bind(&req.filename)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

            if let Some(id) = inserted {
                debug!(
                    subsystem = "db",
                    component = "decodings",
                    op = "claim",
                    identity_key = %key,
                    decoding_uuid = %req.uuid,
                    "Claimed decoding"
                );
                return self
                    .fetch_by_id(id)
                    .await?
                    .map(Claim::Created)
                    .ok_or_else(|| Error::Internal(format!("claimed decoding {} vanished", id)));
            }

            if let Some(existing) = self.find_by_key(&key, req.decoding_set.id).await? {
                debug!(
                    subsystem = "db",
                    component = "decodings",
                    op = "claim",
                    identity_key = %key,
                    decoding_uuid = %existing.uuid,
                    "Identity already claimed"
                );
                return Ok(Claim::Existing(existing));
            }
        }

        Err(Error::Internal(format!(
            "could not claim decoding for {} after {} attempts",
            key, CLAIM_ATTEMPTS
        )))
    }

    async fn get_by_uuid(&self, uuid: &str) -> Result<Option<Decoding>> {
        let row = sqlx::query(&format!("{} WHERE d.uuid = $1", SELECT_DECODING))
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(|r| decoding_from_row(&r)).transpose()
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM decoding WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_complete(&self, id: i64, decoded_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE decoding SET status = 'complete', image_decoded_at = $2, error_message = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(decoded_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("decoding {}", id)));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, message: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE decoding SET status = 'failed', image_decoded_at = NULL, error_message = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("decoding {}", id)));
        }
        Ok(())
    }

    async fn set_filename(&self, id: i64, filename: &str) -> Result<()> {
        sqlx::query("UPDATE decoding SET filename = $2 WHERE id = $1")
            .bind(id)
            .bind(filename)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}

fn decoding_from_row(row: &PgRow) -> Result<Decoding> {
    let identity = DecodingIdentity::from_columns(
        row.get("url"),
        row.get("neurovault_id"),
        row.get("image_id"),
    )?;
    let status: String = row.get("status");
    let uuid: String = row.get("uuid");

    Ok(Decoding {
        id: row.get("id"),
        uuid: uuid.trim_end().to_string(),
        identity,
        decoding_set: row.get("set_name"),
        name: row.get("name"),
        display: row.get("display"),
        download: row.get("download"),
        ip: row.get("ip"),
        image_modified_at: row.get("image_modified_at"),
        image_decoded_at: row.get("image_decoded_at"),
        filename: row.get("filename"),
        status: status.parse::<DecodingStatus>()?,
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
    })
}
