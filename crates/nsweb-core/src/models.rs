//! Domain models for nsweb.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// DECODINGS
// =============================================================================

/// The single field that determines decoding cache uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum DecodingIdentity {
    /// Image fetched from an arbitrary URL.
    Url(String),
    /// Image fetched through the NeuroVault API.
    NeuroVault(i64),
    /// Internally stored analysis image.
    Image(i64),
}

impl DecodingIdentity {
    /// Canonical key stored in the unique `(identity_key, decoding_set)` index.
    pub fn key(&self) -> String {
        match self {
            DecodingIdentity::Url(url) => format!("url:{}", url),
            DecodingIdentity::NeuroVault(id) => format!("neurovault:{}", id),
            DecodingIdentity::Image(id) => format!("image:{}", id),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            DecodingIdentity::Url(url) => Some(url),
            _ => None,
        }
    }

    pub fn neurovault_id(&self) -> Option<i64> {
        match self {
            DecodingIdentity::NeuroVault(id) => Some(*id),
            _ => None,
        }
    }

    pub fn image_id(&self) -> Option<i64> {
        match self {
            DecodingIdentity::Image(id) => Some(*id),
            _ => None,
        }
    }

    /// Rebuild an identity from the three nullable columns.
    ///
    /// Exactly one column must be populated.
    pub fn from_columns(
        url: Option<String>,
        neurovault_id: Option<i64>,
        image_id: Option<i64>,
    ) -> Result<Self> {
        match (url, neurovault_id, image_id) {
            (Some(url), None, None) => Ok(DecodingIdentity::Url(url)),
            (None, Some(id), None) => Ok(DecodingIdentity::NeuroVault(id)),
            (None, None, Some(id)) => Ok(DecodingIdentity::Image(id)),
            _ => Err(Error::Internal(
                "decoding row must have exactly one identity column".to_string(),
            )),
        }
    }
}

impl fmt::Display for DecodingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Lifecycle state of a decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodingStatus {
    /// Claimed; download or decode job still running.
    Pending,
    /// Result table written and completion timestamp set.
    Complete,
    /// Decode job failed; retried on the next request for the same identity.
    Failed,
}

impl DecodingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodingStatus::Pending => "pending",
            DecodingStatus::Complete => "complete",
            DecodingStatus::Failed => "failed",
        }
    }
}

impl FromStr for DecodingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DecodingStatus::Pending),
            "complete" => Ok(DecodingStatus::Complete),
            "failed" => Ok(DecodingStatus::Failed),
            other => Err(Error::Internal(format!("unknown decoding status: {}", other))),
        }
    }
}

/// One decode operation with its cached artifacts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decoding {
    /// Internal row id. Never exposed in URLs.
    #[serde(skip_serializing)]
    pub id: i64,
    /// Public identity: 32 lowercase hex characters.
    pub uuid: String,
    pub identity: DecodingIdentity,
    /// Reference set name, e.g. `terms_20k`.
    pub decoding_set: String,
    /// Display name (URL basename, NeuroVault name or image name).
    pub name: String,
    pub display: bool,
    pub download: bool,
    #[serde(skip_serializing)]
    pub ip: Option<String>,
    pub image_modified_at: Option<DateTime<Utc>>,
    /// Completion timestamp; `None` until the decode job succeeds.
    pub image_decoded_at: Option<DateTime<Utc>>,
    /// Full path of the stored source image.
    #[serde(skip_serializing)]
    pub filename: String,
    pub status: DecodingStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Decoding {
    pub fn is_complete(&self) -> bool {
        self.status == DecodingStatus::Complete && self.image_decoded_at.is_some()
    }
}

/// Insert request for a decoding claim.
#[derive(Debug, Clone)]
pub struct NewDecoding {
    pub uuid: String,
    pub identity: DecodingIdentity,
    pub decoding_set: DecodingSet,
    pub name: String,
    pub display: bool,
    pub download: bool,
    pub ip: Option<String>,
    pub image_modified_at: Option<DateTime<Utc>>,
    pub filename: String,
}

/// Outcome of an atomic insert-if-absent on the decoding registry.
#[derive(Debug, Clone)]
pub enum Claim {
    /// The caller inserted the row and owns the computation.
    Created(Decoding),
    /// Another request holds the identity; its row is returned.
    Existing(Decoding),
}

impl Claim {
    pub fn decoding(&self) -> &Decoding {
        match self {
            Claim::Created(d) | Claim::Existing(d) => d,
        }
    }

    pub fn into_decoding(self) -> Decoding {
        match self {
            Claim::Created(d) | Claim::Existing(d) => d,
        }
    }
}

/// Named reference collection of term/topic maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodingSet {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub n_images: i32,
}

/// One row of a decoding result table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodingResult {
    pub analysis: String,
    pub r: f64,
}

// =============================================================================
// STUDIES, PEAKS, IMAGES
// =============================================================================

/// Bibliographic record owning zero or more peaks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub pmid: i64,
    pub title: String,
    pub authors: String,
    pub journal: String,
    pub year: Option<i32>,
}

/// A reported activation coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub id: i64,
    pub pmid: i64,
    pub table_name: Option<String>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A study with the number of its peaks inside a query sphere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyPeakCount {
    pub study: Study,
    pub peaks: i64,
}

/// Internally stored analysis image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub name: String,
    pub label: String,
    /// Path relative to the configured images directory.
    pub image_file: String,
    pub display: bool,
}

// =============================================================================
// JOBS
// =============================================================================

/// Kinds of numeric work executed by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    VoxelLookup,
    DecodeImage,
    RenderScatterplot,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::VoxelLookup => "voxel_lookup",
            JobType::DecodeImage => "decode_image",
            JobType::RenderScatterplot => "render_scatterplot",
        }
    }
}

/// A job submitted to the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub payload: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_type: JobType, payload: JsonValue) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type,
            payload: Some(payload),
            created_at: Utc::now(),
        }
    }
}

/// Payload for [`JobType::VoxelLookup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelLookupPayload {
    pub reference: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub include_posterior: bool,
}

/// Payload for [`JobType::DecodeImage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeImagePayload {
    pub image_path: String,
    pub decoding_set: String,
    pub decoding_uuid: String,
}

/// Payload for [`JobType::RenderScatterplot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScatterplotPayload {
    pub image_path: String,
    /// Reference set holding `analysis`.
    pub decoding_set: String,
    pub analysis: String,
    pub decoding_uuid: String,
    pub output_path: String,
    pub x_label: String,
}

/// Value of one reference analysis at a voxel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelValue {
    pub analysis: String,
    /// Reverse-inference z-score.
    pub z: f64,
    /// Posterior probability, when requested and available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pp: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_keys() {
        assert_eq!(
            DecodingIdentity::Url("http://a.org/x.nii".into()).key(),
            "url:http://a.org/x.nii"
        );
        assert_eq!(DecodingIdentity::NeuroVault(12345).key(), "neurovault:12345");
        assert_eq!(DecodingIdentity::Image(7).key(), "image:7");
    }

    #[test]
    fn test_identity_from_columns_exactly_one() {
        let id = DecodingIdentity::from_columns(None, Some(3), None).unwrap();
        assert_eq!(id, DecodingIdentity::NeuroVault(3));
        assert_eq!(id.neurovault_id(), Some(3));
        assert!(id.url().is_none());

        assert!(DecodingIdentity::from_columns(None, None, None).is_err());
        assert!(DecodingIdentity::from_columns(Some("u".into()), Some(1), None).is_err());
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            DecodingStatus::Pending,
            DecodingStatus::Complete,
            DecodingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DecodingStatus>().unwrap(), status);
        }
        assert!("done".parse::<DecodingStatus>().is_err());
    }

    #[test]
    fn test_decoding_serialization_hides_internal_fields() {
        let decoding = Decoding {
            id: 42,
            uuid: "a".repeat(32),
            identity: DecodingIdentity::Image(1),
            decoding_set: "terms_20k".into(),
            name: "amygdala".into(),
            display: true,
            download: false,
            ip: Some("10.0.0.1".into()),
            image_modified_at: None,
            image_decoded_at: None,
            filename: "/secret/path.nii.gz".into(),
            status: DecodingStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&decoding).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("filename").is_none());
        assert!(json.get("ip").is_none());
        assert_eq!(json["status"], "pending");
        assert_eq!(json["identity"]["kind"], "image");
        assert!(!decoding.is_complete());
    }

    #[test]
    fn test_job_type_names() {
        assert_eq!(JobType::VoxelLookup.as_str(), "voxel_lookup");
        assert_eq!(JobType::DecodeImage.as_str(), "decode_image");
        assert_eq!(JobType::RenderScatterplot.as_str(), "render_scatterplot");
    }

    #[test]
    fn test_voxel_value_omits_missing_posterior() {
        let v = VoxelValue {
            analysis: "pain".into(),
            z: 3.2,
            pp: None,
        };
        let json = serde_json::to_value(&v).unwrap();
        assert!(json.get("pp").is_none());
    }
}
