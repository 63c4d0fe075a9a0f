//! Outbound HTTP: remote image hosts and the NeuroVault API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, LAST_MODIFIED};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use nsweb_core::{Error, Result};

/// What a HEAD request revealed about a remote image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteHead {
    pub content_length: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// NeuroVault image metadata relevant to decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum NeuroVaultImage {
    /// The API answered without a downloadable `file`.
    Missing,
    Found {
        file: String,
        name: Option<String>,
        modified_at: Option<DateTime<Utc>>,
    },
}

/// Parse an HTTP date (`Last-Modified`).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn too_large(max_bytes: u64) -> Error {
    Error::Validation(format!(
        "The requested NIfTI image is too large. Files must be at most {} bytes.",
        max_bytes
    ))
}

fn content_length(resp: &Response) -> Option<u64> {
    resp.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// HTTP client with the image size cap applied.
#[derive(Clone)]
pub struct RemoteFetcher {
    client: Client,
    neurovault_api_url: String,
    max_bytes: u64,
}

impl RemoteFetcher {
    pub fn new(neurovault_api_url: &str, max_bytes: u64, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nsweb/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            neurovault_api_url: neurovault_api_url.trim_end_matches('/').to_string(),
            max_bytes,
        })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Check that an image exists and is not over the size cap.
    ///
    /// Success and redirect statuses count as found. A `Content-Length`
    /// equal to the cap is accepted.
    pub async fn head(&self, url: &str) -> Result<RemoteHead> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("No image was found at the provided URL: {}", e)))?;

        let status = resp.status();
        if !(status.is_success() || status.is_redirection()) {
            return Err(Error::Upstream(format!(
                "No image was found at the provided URL (HTTP {})",
                status.as_u16()
            )));
        }

        let head = RemoteHead {
            content_length: content_length(&resp),
            last_modified: resp
                .headers()
                .get(LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_http_date),
        };
        debug!(
            subsystem = "api",
            component = "remote",
            op = "head",
            url = %url,
            size_bytes = head.content_length,
            "Remote image found"
        );

        if head.content_length.map_or(false, |len| len > self.max_bytes) {
            return Err(too_large(self.max_bytes));
        }
        Ok(head)
    }

    /// Download an image body, enforcing the size cap while streaming.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("Download of {} failed: {}", url, e)))?;

        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "Download of {} failed (HTTP {})",
                url,
                resp.status().as_u16()
            )));
        }
        if content_length(&resp).map_or(false, |len| len > self.max_bytes) {
            return Err(too_large(self.max_bytes));
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| Error::Upstream(format!("Download of {} failed: {}", url, e)))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(too_large(self.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        debug!(
            subsystem = "api",
            component = "remote",
            op = "download",
            url = %url,
            size_bytes = body.len() as u64,
            "Remote image downloaded"
        );
        Ok(body)
    }

    /// Fetch image metadata from NeuroVault.
    pub async fn neurovault_image(&self, id: i64) -> Result<NeuroVaultImage> {
        let url = format!("{}/images/{}/?format=json", self.neurovault_api_url, id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("NeuroVault lookup failed: {}", e)))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(NeuroVaultImage::Missing);
        }
        if !status.is_success() {
            return Err(Error::Upstream(format!(
                "NeuroVault lookup failed (HTTP {})",
                status.as_u16()
            )));
        }

        let metadata: JsonValue = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("NeuroVault returned invalid JSON: {}", e)))?;
        Ok(Self::parse_neurovault(id, &metadata))
    }

    fn parse_neurovault(id: i64, metadata: &JsonValue) -> NeuroVaultImage {
        let Some(file) = metadata.get("file").and_then(JsonValue::as_str) else {
            warn!(
                subsystem = "api",
                component = "remote",
                neurovault_id = id,
                "NeuroVault image has no file"
            );
            return NeuroVaultImage::Missing;
        };
        NeuroVaultImage::Found {
            file: file.to_string(),
            name: metadata
                .get("name")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            modified_at: metadata
                .get("modify_date")
                .and_then(JsonValue::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_http_date() {
        let dt = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(dt.to_rfc3339(), "2015-10-21T07:28:00+00:00");
        assert!(parse_http_date("yesterday").is_none());
    }

    #[test]
    fn test_parse_neurovault_metadata() {
        let found = RemoteFetcher::parse_neurovault(
            7,
            &json!({
                "file": "http://neurovault.org/media/images/1/map.nii.gz",
                "name": "Working memory",
                "modify_date": "2015-03-04T11:16:33.745452Z"
            }),
        );
        match found {
            NeuroVaultImage::Found {
                file,
                name,
                modified_at,
            } => {
                assert!(file.ends_with("map.nii.gz"));
                assert_eq!(name.as_deref(), Some("Working memory"));
                assert!(modified_at.is_some());
            }
            NeuroVaultImage::Missing => panic!("expected metadata"),
        }

        assert_eq!(
            RemoteFetcher::parse_neurovault(7, &json!({"detail": "Not found."})),
            NeuroVaultImage::Missing
        );
    }
}
