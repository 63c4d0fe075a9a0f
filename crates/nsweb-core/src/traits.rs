//! Repository traits for nsweb storage backends.
//!
//! PostgreSQL and in-memory implementations live in `nsweb-db`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::*;

// =============================================================================
// DECODING REGISTRY
// =============================================================================

/// Registry of decodings, unique per (identity, reference set).
#[async_trait]
pub trait DecodingRepository: Send + Sync {
    /// Find the decoding for an identity within a reference set.
    async fn find(&self, identity: &DecodingIdentity, set_id: i64) -> Result<Option<Decoding>>;

    /// Atomically insert a pending decoding unless one already exists.
    async fn claim(&self, req: NewDecoding) -> Result<Claim>;

    /// Fetch by public UUID.
    async fn get_by_uuid(&self, uuid: &str) -> Result<Option<Decoding>>;

    /// Delete a decoding row. Returns false if it did not exist.
    async fn delete(&self, id: i64) -> Result<bool>;

    /// Record successful completion.
    async fn mark_complete(&self, id: i64, decoded_at: DateTime<Utc>) -> Result<()>;

    /// Record a failed decode.
    async fn mark_failed(&self, id: i64, message: &str) -> Result<()>;

    /// Update the stored source image path.
    async fn set_filename(&self, id: i64, filename: &str) -> Result<()>;
}

/// Read-only access to reference sets.
#[async_trait]
pub trait DecodingSetRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<DecodingSet>>;

    async fn get_by_name(&self, name: &str) -> Result<Option<DecodingSet>>;
}

// =============================================================================
// LITERATURE
// =============================================================================

/// Spatial queries over activation peaks.
#[async_trait]
pub trait PeakRepository: Send + Sync {
    /// Studies with peaks within `radius` mm of `(x, y, z)`, ordered by pmid.
    ///
    /// Callers pass a radius already run through [`crate::clamp_radius`].
    async fn find_nearby(&self, x: f64, y: f64, z: f64, radius: f64)
        -> Result<Vec<StudyPeakCount>>;
}

/// Internal analysis images.
#[async_trait]
pub trait ImageRepository: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<Image>>;

    /// Displayable images attached to an integer grid location.
    async fn images_at_location(&self, x: i32, y: i32, z: i32) -> Result<Vec<Image>>;
}
