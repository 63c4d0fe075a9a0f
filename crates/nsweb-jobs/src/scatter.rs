//! Scatterplot of an input image against one reference map, as PNG.
//!
//! No font rendering: axis labels travel as PNG text chunks (`x_label`,
//! `y_label`) next to the pixel data.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use nsweb_core::{defaults, validate_analysis_name, Error, JobType, Result, ScatterplotPayload};
use nsweb_db::artifacts::ARTIFACT_MODE;
use nsweb_db::write_atomic;

use crate::decode::{load_on_grid, usable_voxels};
use crate::handler::{JobContext, JobHandler, JobResult};
use crate::reference::ReferenceLibrary;

const MARGIN_LEFT: u32 = 60;
const MARGIN_RIGHT: u32 = 20;
const MARGIN_TOP: u32 = 20;
const MARGIN_BOTTOM: u32 = 50;
const TICKS: u32 = 5;
const TICK_LEN: u32 = 6;

const WHITE: [u8; 3] = [255, 255, 255];
const AXIS: [u8; 3] = [40, 40, 40];
const GRID: [u8; 3] = [230, 230, 230];
const POINT: [u8; 3] = [31, 119, 180];
const FIT: [u8; 3] = [214, 39, 40];

/// Every `step`-th pair so at most `max` remain; order is preserved.
pub fn subsample<T: Copy>(items: &[T], max: usize) -> Vec<T> {
    if max == 0 || items.len() <= max {
        return items.to_vec();
    }
    let step = items.len().div_ceil(max);
    items.iter().step_by(step).copied().collect()
}

/// Least-squares `(slope, intercept)` of y on x; `None` when x is constant.
pub fn least_squares(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (x, y) in points {
        sxy += (x - mean_x) * (y - mean_y);
        sxx += (x - mean_x).powi(2);
    }
    if sxx <= f64::EPSILON {
        return None;
    }
    let slope = sxy / sxx;
    Some((slope, mean_y - slope * mean_x))
}

/// Data range padded by 5%, never empty.
fn padded_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !lo.is_finite() || !hi.is_finite() {
        return (-1.0, 1.0);
    }
    if hi - lo < 1e-9 {
        return (lo - 1.0, hi + 1.0);
    }
    let pad = (hi - lo) * 0.05;
    (lo - pad, hi + pad)
}

struct Canvas {
    size: u32,
    pixels: Vec<u8>,
}

impl Canvas {
    fn new(size: u32) -> Self {
        let mut pixels = Vec::with_capacity((size * size * 3) as usize);
        for _ in 0..size * size {
            pixels.extend_from_slice(&WHITE);
        }
        Self { size, pixels }
    }

    fn set(&mut self, x: i64, y: i64, color: [u8; 3]) {
        if x < 0 || y < 0 || x >= self.size as i64 || y >= self.size as i64 {
            return;
        }
        let offset = ((y as usize) * self.size as usize + x as usize) * 3;
        self.pixels[offset..offset + 3].copy_from_slice(&color);
    }

    fn hline(&mut self, x0: u32, x1: u32, y: u32, color: [u8; 3]) {
        for x in x0..=x1 {
            self.set(x as i64, y as i64, color);
        }
    }

    fn vline(&mut self, x: u32, y0: u32, y1: u32, color: [u8; 3]) {
        for y in y0..=y1 {
            self.set(x as i64, y as i64, color);
        }
    }

    /// Bresenham line, two pixels thick, clipped to `clip` (x0, y0, x1, y1).
    fn line(&mut self, from: (i64, i64), to: (i64, i64), clip: (i64, i64, i64, i64), color: [u8; 3]) {
        let (mut x, mut y) = from;
        let dx = (to.0 - x).abs();
        let dy = -(to.1 - y).abs();
        let sx = if x < to.0 { 1 } else { -1 };
        let sy = if y < to.1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            if x >= clip.0 && x <= clip.2 && y >= clip.1 && y <= clip.3 {
                self.set(x, y, color);
                self.set(x, y + 1, color);
            }
            if x == to.0 && y == to.1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }
}

/// Render the scatterplot and encode it as an RGB PNG.
pub fn render_png(points: &[(f64, f64)], x_label: &str, y_label: &str, size: u32) -> Result<Vec<u8>> {
    let mut canvas = Canvas::new(size);
    let (left, top) = (MARGIN_LEFT, MARGIN_TOP);
    let right = size.saturating_sub(MARGIN_RIGHT + 1).max(left + 1);
    let bottom = size.saturating_sub(MARGIN_BOTTOM + 1).max(top + 1);

    let (x_lo, x_hi) = padded_range(points.iter().map(|p| p.0));
    let (y_lo, y_hi) = padded_range(points.iter().map(|p| p.1));
    let to_px = |x: f64, y: f64| -> (i64, i64) {
        let px = left as f64 + (x - x_lo) / (x_hi - x_lo) * (right - left) as f64;
        let py = bottom as f64 - (y - y_lo) / (y_hi - y_lo) * (bottom - top) as f64;
        (px.round() as i64, py.round() as i64)
    };

    for t in 0..=TICKS {
        let x = left + (right - left) * t / TICKS;
        let y = top + (bottom - top) * t / TICKS;
        canvas.vline(x, top, bottom, GRID);
        canvas.hline(left, right, y, GRID);
        canvas.vline(x, bottom, bottom + TICK_LEN, AXIS);
        canvas.hline(left.saturating_sub(TICK_LEN), left, y, AXIS);
    }
    canvas.hline(left, right, bottom, AXIS);
    canvas.vline(left, top, bottom, AXIS);

    for &(x, y) in points {
        let (px, py) = to_px(x, y);
        for (ox, oy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            canvas.set(px + ox, py + oy, POINT);
        }
    }

    if let Some((slope, intercept)) = least_squares(points) {
        let from = to_px(x_lo, slope * x_lo + intercept);
        let to = to_px(x_hi, slope * x_hi + intercept);
        let clip = (left as i64, top as i64, right as i64, bottom as i64);
        canvas.line(from, to, clip, FIT);
    }

    encode_png(&canvas, x_label, y_label)
}

/// Keep Latin-1 characters only; tEXt chunks cannot carry anything else.
fn latin1(text: &str) -> String {
    text.chars()
        .map(|c| if (c as u32) < 256 && !c.is_control() { c } else { '?' })
        .collect()
}

fn encode_png(canvas: &Canvas, x_label: &str, y_label: &str) -> Result<Vec<u8>> {
    let png_err = |e: png::EncodingError| Error::Internal(format!("PNG encoding failed: {}", e));
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, canvas.size, canvas.size);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        encoder
            .add_text_chunk("x_label".to_string(), latin1(x_label))
            .map_err(png_err)?;
        encoder
            .add_text_chunk("y_label".to_string(), latin1(y_label))
            .map_err(png_err)?;
        let mut writer = encoder.write_header().map_err(png_err)?;
        writer.write_image_data(&canvas.pixels).map_err(png_err)?;
        writer.finish().map_err(png_err)?;
    }
    Ok(out)
}

/// Handler for [`JobType::RenderScatterplot`]; writes the PNG to `output_path`.
pub struct ScatterHandler {
    library: Arc<ReferenceLibrary>,
}

impl ScatterHandler {
    pub fn new(library: Arc<ReferenceLibrary>) -> Self {
        Self { library }
    }

    async fn render(&self, payload: &ScatterplotPayload) -> Result<usize> {
        validate_analysis_name(&payload.analysis)?;
        let library = self.library.clone();
        let p = payload.clone();

        let (png, n_points) = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, usize)> {
            let set = library.get(&p.decoding_set)?;
            let map = set.get(&p.analysis).ok_or_else(|| {
                Error::NotFound(format!("analysis {} in {}", p.analysis, p.decoding_set))
            })?;
            let input = load_on_grid(&p.image_path, &set)?;
            let pairs: Vec<(f64, f64)> = usable_voxels(&input)
                .into_iter()
                .filter(|&idx| map.values[idx].is_finite())
                .map(|idx| (input[idx] as f64, map.values[idx] as f64))
                .collect();
            let points = subsample(&pairs, defaults::SCATTER_MAX_POINTS);
            let png = render_png(&points, &p.x_label, &p.analysis, defaults::SCATTER_SIZE_PX)?;
            Ok((png, points.len()))
        })
        .await
        .map_err(|e| Error::Internal(format!("scatterplot task panicked: {}", e)))??;

        write_atomic(Path::new(&payload.output_path), &png, ARTIFACT_MODE).await?;
        Ok(n_points)
    }
}

#[async_trait]
impl JobHandler for ScatterHandler {
    fn job_type(&self) -> JobType {
        JobType::RenderScatterplot
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let payload: ScatterplotPayload = match ctx.typed_payload() {
            Ok(p) => p,
            Err(e) => return JobResult::Failed(e),
        };
        let start = Instant::now();

        match self.render(&payload).await {
            Ok(n_points) => {
                info!(
                    subsystem = "jobs",
                    component = "scatter",
                    op = "render_scatterplot",
                    decoding_uuid = %payload.decoding_uuid,
                    analysis = %payload.analysis,
                    n_points,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Scatterplot rendered"
                );
                JobResult::Success(Some(json!({ "n_points": n_points })))
            }
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "scatter",
                    op = "render_scatterplot",
                    decoding_uuid = %payload.decoding_uuid,
                    analysis = %payload.analysis,
                    error = %e,
                    "Scatterplot failed"
                );
                JobResult::Failed(e.to_string())
            }
        }
    }
}
