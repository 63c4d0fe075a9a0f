//! Location handlers: studies near a coordinate and voxel values.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use nsweb_core::{clamp_radius, Error};
use nsweb_jobs::voxel_reference;

use crate::services::VoxelKey;
use crate::{ApiError, AppState};

/// A parsed `x_y_z[_r]` path segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub radius: Option<f64>,
}

/// Parse `x_y_z` or `x_y_z_r`; coordinates are integers, the radius may not be.
pub fn parse_coords(segment: &str) -> Result<Coordinates, Error> {
    let invalid = || Error::Validation(format!("Invalid coordinates: {}", segment));
    let parts: Vec<&str> = segment.trim_end_matches('/').split('_').collect();
    if !(3..=4).contains(&parts.len()) {
        return Err(invalid());
    }
    let axis = |s: &str| s.trim().parse::<i32>().map_err(|_| invalid());
    let radius = match parts.get(3) {
        Some(r) => Some(r.trim().parse::<f64>().map_err(|_| invalid())?),
        None => None,
    };
    Ok(Coordinates {
        x: axis(parts[0])?,
        y: axis(parts[1])?,
        z: axis(parts[2])?,
        radius,
    })
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Default, Deserialize)]
pub struct LocationQuery {
    /// Present when the table widget asks for rows.
    pub draw: Option<String>,
}

/// Studies with peaks near a coordinate, plus images attached to it.
///
/// # Path Parameters
/// - `coords`: `x_y_z` or `x_y_z_r` (radius defaults to 6 mm, capped at 20)
///
/// # Returns
/// - 200 OK with `{"data": {"studies": [...], "images": [...]}}`
/// - 200 OK with `{"data": [[link, authors, journal, peaks], ...]}` when `draw` is set
/// - 400 Bad Request for malformed coordinates or radius
pub async fn studies_near(
    State(state): State<AppState>,
    Path(coords): Path<String>,
    Query(query): Query<LocationQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let c = parse_coords(&coords)?;
    let radius = clamp_radius(c.radius)?;
    let studies = state
        .peaks
        .find_nearby(c.x as f64, c.y as f64, c.z as f64, radius)
        .await?;

    if query.draw.is_some() {
        let rows: Vec<JsonValue> = studies
            .iter()
            .map(|s| {
                json!([
                    format!(
                        "<a href=\"/studies/{}\">{}</a>",
                        s.study.pmid,
                        escape_html(&s.study.title)
                    ),
                    s.study.authors,
                    s.study.journal,
                    s.peaks,
                ])
            })
            .collect();
        return Ok(Json(json!({ "data": rows })));
    }

    let images = state.images.images_at_location(c.x, c.y, c.z).await?;
    let studies: Vec<JsonValue> = studies
        .iter()
        .map(|s| json!({ "pmid": s.study.pmid, "peaks": s.peaks }))
        .collect();
    let images: Vec<JsonValue> = images
        .iter()
        .filter(|i| i.display)
        .map(|i| json!({ "label": i.label, "id": i.id }))
        .collect();
    Ok(Json(json!({
        "data": { "studies": studies, "images": images }
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ValuesQuery {
    /// `terms` (default) or `topics`; anything else falls back to `terms`.
    pub reference: Option<String>,
    /// Include posterior probabilities (default true).
    pub posterior: Option<String>,
}

/// Values of every reference map at a voxel, memoized by the voxel cache.
pub async fn voxel_values(
    State(state): State<AppState>,
    Path(coords): Path<String>,
    Query(query): Query<ValuesQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let c = parse_coords(&coords)?;
    let reference = voxel_reference(query.reference.as_deref().unwrap_or_default());
    let include_posterior = !matches!(query.posterior.as_deref(), Some("false" | "0"));

    let key = VoxelKey {
        x: c.x,
        y: c.y,
        z: c.z,
        reference: reference.to_string(),
        include_posterior,
    };
    let dispatcher = state.dispatcher.clone();
    let rows = state
        .voxels
        .get_or_fetch(key, || async move {
            dispatcher
                .voxel_lookup(reference, c.x, c.y, c.z, include_posterior)
                .await
        })
        .await?;
    Ok(Json(json!({ "data": *rows })))
}
