//! Image decoding: correlate an input image with every map of a reference set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, trace, warn};

use nsweb_core::{DecodeImagePayload, DecodingResult, Error, JobType, Result};
use nsweb_db::ArtifactStore;

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::nifti;
use crate::reference::{ReferenceLibrary, ReferenceSet};

/// Fewest voxels a correlation is computed over.
pub const MIN_USABLE_VOXELS: usize = 3;

/// Indices where the input carries signal: finite and non-zero.
pub(crate) fn usable_voxels(input: &[f32]) -> Vec<usize> {
    input
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite() && **v != 0.0)
        .map(|(idx, _)| idx)
        .collect()
}

/// Pearson correlation over paired samples; NaN when either side is constant.
pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return f64::NAN;
    }
    let mean_x = xs[..n].iter().sum::<f64>() / n as f64;
    let mean_y = ys[..n].iter().sum::<f64>() / n as f64;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in xs[..n].iter().zip(&ys[..n]) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return f64::NAN;
    }
    (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0)
}

/// Correlate `input` (already on the set's grid) with every reference map.
///
/// Rows are sorted by r descending; undefined correlations sort last.
pub fn correlate(input: &[f32], set: &ReferenceSet) -> Result<Vec<DecodingResult>> {
    if input.len() != set.grid.len() {
        return Err(Error::Internal(format!(
            "input has {} voxels, reference grid has {}",
            input.len(),
            set.grid.len()
        )));
    }
    let mask = usable_voxels(input);
    if mask.len() < MIN_USABLE_VOXELS {
        return Err(Error::Validation(format!(
            "image has {} usable voxels inside the reference volume, need at least {}",
            mask.len(),
            MIN_USABLE_VOXELS
        )));
    }

    let mut rows: Vec<DecodingResult> = set
        .maps
        .iter()
        .map(|map| {
            let (xs, ys): (Vec<f64>, Vec<f64>) = mask
                .iter()
                .filter(|&&idx| map.values[idx].is_finite())
                .map(|&idx| (input[idx] as f64, map.values[idx] as f64))
                .unzip();
            let r = if xs.len() < MIN_USABLE_VOXELS {
                f64::NAN
            } else {
                pearson(&xs, &ys)
            };
            trace!(analysis = %map.analysis, r, voxels = xs.len(), "decode: analysis scored");
            DecodingResult {
                analysis: map.analysis.clone(),
                r,
            }
        })
        .collect();

    rows.sort_by(|a, b| match (a.r.is_nan(), b.r.is_nan()) {
        (false, false) => b.r.total_cmp(&a.r),
        (a_nan, b_nan) => a_nan.cmp(&b_nan),
    });
    Ok(rows)
}

/// Read an image from disk and resample it onto `set`'s grid.
pub(crate) fn load_on_grid(image_path: &str, set: &ReferenceSet) -> Result<Vec<f32>> {
    let volume = nifti::read_file(&PathBuf::from(image_path))?;
    Ok(volume.resample_to(&set.grid))
}

/// Handler for [`JobType::DecodeImage`]; writes the decoding's result table.
pub struct DecodeHandler {
    library: Arc<ReferenceLibrary>,
    artifacts: ArtifactStore,
}

impl DecodeHandler {
    pub fn new(library: Arc<ReferenceLibrary>, artifacts: ArtifactStore) -> Self {
        Self { library, artifacts }
    }

    async fn decode(&self, ctx: &JobContext, payload: &DecodeImagePayload) -> Result<usize> {
        let library = self.library.clone();
        let set_name = payload.decoding_set.clone();
        let image_path = payload.image_path.clone();

        let rows = tokio::task::spawn_blocking(move || {
            let set = library.get(&set_name)?;
            let input = load_on_grid(&image_path, &set)?;
            correlate(&input, &set)
        })
        .await
        .map_err(|e| Error::Internal(format!("decode task panicked: {}", e)))??;

        ctx.report_progress(80, Some("Writing result table"));
        self.artifacts
            .write_results(&payload.decoding_uuid, &rows)
            .await?;
        Ok(rows.len())
    }
}

#[async_trait]
impl JobHandler for DecodeHandler {
    fn job_type(&self) -> JobType {
        JobType::DecodeImage
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let payload: DecodeImagePayload = match ctx.typed_payload() {
            Ok(p) => p,
            Err(e) => return JobResult::Failed(e),
        };
        let start = Instant::now();
        ctx.report_progress(10, Some("Loading reference set"));

        match self.decode(&ctx, &payload).await {
            Ok(n) => {
                info!(
                    subsystem = "jobs",
                    component = "decoder",
                    op = "decode_image",
                    decoding_uuid = %payload.decoding_uuid,
                    decoding_set = %payload.decoding_set,
                    result_count = n,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Image decoded"
                );
                JobResult::Success(Some(json!({ "n_analyses": n })))
            }
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "decoder",
                    op = "decode_image",
                    decoding_uuid = %payload.decoding_uuid,
                    error = %e,
                    "Decode failed"
                );
                JobResult::Failed(e.to_string())
            }
        }
    }
}
