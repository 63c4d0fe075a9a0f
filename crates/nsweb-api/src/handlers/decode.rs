//! Decoding HTTP handlers.
//!
//! `GET /decode/` starts (or reuses) a decoding and redirects to its page;
//! the per-UUID routes serve the record, the result table, the source image
//! and lazily rendered scatterplots.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use nsweb_core::Error;

use crate::services::{DecodeOutcome, DecodeRequest};
use crate::{ApiError, AppState};

/// Query parameters accepted by the decode entry points.
#[derive(Debug, Default, Deserialize)]
pub struct DecodeQuery {
    pub url: Option<String>,
    /// NeuroVault image id.
    pub neurovault: Option<String>,
    /// Internal image id.
    pub image: Option<String>,
    /// Reference set name or the `terms` / `topics` shorthand.
    pub set: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_id(param: &str, value: &str) -> Result<i64, Error> {
    value
        .parse()
        .map_err(|_| Error::Validation(format!("Invalid {} id: {}", param, value)))
}

impl DecodeQuery {
    /// The decode request named by the query, if any. `url` wins over
    /// `neurovault`, which wins over `image`.
    pub fn request(&self) -> Result<Option<DecodeRequest>, Error> {
        if let Some(url) = non_empty(&self.url) {
            return Ok(Some(DecodeRequest::Url(url.to_string())));
        }
        if let Some(id) = non_empty(&self.neurovault) {
            return parse_id("neurovault", id).map(|id| Some(DecodeRequest::NeuroVault(id)));
        }
        if let Some(id) = non_empty(&self.image) {
            return parse_id("image", id).map(|id| Some(DecodeRequest::Image(id)));
        }
        Ok(None)
    }
}

/// Originating client address from proxy headers.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    header_value("x-forwarded-for").or_else(|| header_value("x-real-ip"))
}

fn decoding_location(uuid: &str) -> String {
    format!("/decode/{}/", uuid)
}

/// Decode entry point.
///
/// # Returns
/// - 200 OK with `{"sets": [...]}` when no image is named
/// - 303 See Other to `/decode/<uuid>/` once the decoding exists
/// - 200 OK with `{"status": "missing"}` for NeuroVault images without a file
/// - 400 / 502 for invalid input or an unreachable image
pub async fn decode_index(
    State(state): State<AppState>,
    Query(query): Query<DecodeQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let Some(request) = query.request()? else {
        let sets = state.decoder.list_sets().await?;
        return Ok(Json(json!({ "sets": sets })).into_response());
    };

    match state
        .decoder
        .decode(request, query.set.as_deref(), client_ip(&headers))
        .await?
    {
        DecodeOutcome::Decoded(decoding) => {
            Ok(Redirect::to(&decoding_location(&decoding.uuid)).into_response())
        }
        DecodeOutcome::Missing => Ok(Json(json!({ "status": "missing" })).into_response()),
    }
}

/// Result table for a decode request, decoding first when needed.
pub async fn decode_data(
    State(state): State<AppState>,
    Query(query): Query<DecodeQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = query.request()?.ok_or_else(|| {
        Error::Validation("One of url, neurovault or image is required".to_string())
    })?;

    let decoding = match state
        .decoder
        .decode(request, query.set.as_deref(), client_ip(&headers))
        .await?
    {
        DecodeOutcome::Decoded(decoding) => decoding,
        DecodeOutcome::Missing => {
            return Err(Error::NotFound("NeuroVault image has no file".to_string()).into())
        }
    };
    let rows = state.decoder.data(&decoding.uuid).await?;
    Ok(Json(json!({ "data": rows })))
}

/// Decoding record plus the viewer descriptor for its source image.
pub async fn show_decoding(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let decoding = state.decoder.get(&uuid).await?;
    let image_url = format!("/decode/{}/image", decoding.uuid);
    Ok(Json(json!({
        "images": [{
            "id": decoding.uuid,
            "name": decoding.name,
            "colorPalette": "intense red-blue",
            "sign": "both",
            "url": image_url,
            "download": image_url,
        }],
        "decoding": decoding,
    })))
}

/// `{"data": [{"analysis", "r"}]}` for a completed decoding.
pub async fn decoding_data(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rows = state.decoder.data(&uuid).await?;
    Ok(Json(json!({ "data": rows })))
}

/// Source image download.
pub async fn decoding_image(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Response, ApiError> {
    let (bytes, filename) = state.decoder.image(&uuid).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", filename),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// Scatterplot PNG; the analysis may carry a `.png` suffix.
pub async fn decoding_scatterplot(
    State(state): State<AppState>,
    Path((uuid, analysis)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let analysis = analysis.strip_suffix(".png").unwrap_or(&analysis);
    let png = state.decoder.scatterplot(&uuid, analysis).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(url: Option<&str>, neurovault: Option<&str>, image: Option<&str>) -> DecodeQuery {
        DecodeQuery {
            url: url.map(String::from),
            neurovault: neurovault.map(String::from),
            image: image.map(String::from),
            set: None,
        }
    }

    #[test]
    fn test_request_precedence() {
        assert_eq!(
            query(Some("a.org/x.nii"), Some("3"), None).request().unwrap(),
            Some(DecodeRequest::Url("a.org/x.nii".into()))
        );
        assert_eq!(
            query(Some("  "), Some("3"), Some("9")).request().unwrap(),
            Some(DecodeRequest::NeuroVault(3))
        );
        assert_eq!(
            query(None, None, Some("9")).request().unwrap(),
            Some(DecodeRequest::Image(9))
        );
        assert_eq!(query(None, None, None).request().unwrap(), None);
    }

    #[test]
    fn test_bad_ids_are_validation_errors() {
        assert!(matches!(
            query(None, Some("abc"), None).request(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.0.0.2".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.2"));
        headers.insert("x-forwarded-for", "192.0.2.1, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("192.0.2.1"));
        assert_eq!(client_ip(&HeaderMap::new()), None);
    }
}
