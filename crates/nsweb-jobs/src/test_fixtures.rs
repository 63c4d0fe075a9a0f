//! Synthetic reference data for tests.
//!
//! Every fixture lives on [`reference_grid`], a 4mm grid with MNI (0, 0, 0)
//! at voxel (5, 6, 5). Map values are small integer patterns so expected
//! correlations and voxel values can be computed exactly in tests.
//!
//! | analysis | values | against [`write_input_image`] |
//! |----------|--------|-------------------------------|
//! | `pain` | `pattern` | r = 1 |
//! | `memory` | `-pattern` | r = -1 |
//! | `noise` | `alternate_pattern` | in between |
//!
//! `pain` also has a posterior map, `pain_pp`.

use std::path::{Path, PathBuf};

use crate::nifti::{self, Affine, Grid, Volume};

/// Analyses written by [`write_reference_set`], sorted.
pub const FIXTURE_ANALYSES: [&str; 3] = ["memory", "noise", "pain"];

/// Set names written by [`write_reference_library`].
pub const FIXTURE_SETS: [&str; 4] = ["terms_20k", "topics_20k", "terms", "topics"];

pub fn reference_grid() -> Grid {
    Grid::new(
        [10, 12, 10],
        Affine([
            [-4.0, 0.0, 0.0, 20.0],
            [0.0, 4.0, 0.0, -24.0],
            [0.0, 0.0, 4.0, -20.0],
        ]),
    )
}

/// Integer pattern in [-5, 5].
pub fn pattern(i: usize, j: usize, k: usize) -> f32 {
    ((i * 7 + j * 3 + k * 5) % 11) as f32 - 5.0
}

/// A second pattern only partly correlated with [`pattern`].
pub fn alternate_pattern(i: usize, j: usize, k: usize) -> f32 {
    ((i * 2 + j * 5 + k * 11) % 7) as f32 - 3.0
}

/// Posterior probability paired with `pain`.
pub fn posterior(i: usize, j: usize, k: usize) -> f32 {
    0.5 + pattern(i, j, k) / 20.0
}

fn fill(grid: &Grid, f: impl Fn(usize, usize, usize) -> f32) -> Vec<f32> {
    let mut out = Vec::with_capacity(grid.len());
    for k in 0..grid.dims[2] {
        for j in 0..grid.dims[1] {
            for i in 0..grid.dims[0] {
                out.push(f(i, j, k));
            }
        }
    }
    out
}

/// Write `<dir>/<analysis>.nii.gz` and return its path.
pub fn write_map(dir: &Path, analysis: &str, grid: &Grid, data: Vec<f32>) -> PathBuf {
    let path = dir.join(format!("{}.nii.gz", analysis));
    write_volume(&path, grid, data);
    path
}

/// Write a volume, panicking on failure.
pub fn write_volume(path: &Path, grid: &Grid, data: Vec<f32>) {
    let volume = Volume::new(grid.clone(), data).expect("fixture data matches grid");
    nifti::write_file(path, &volume).expect("write fixture volume");
}

/// Write the fixture maps into `<root>/<name>/`.
pub fn write_reference_set(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).expect("create reference set dir");
    let grid = reference_grid();
    write_map(&dir, "pain", &grid, fill(&grid, pattern));
    write_map(&dir, "pain_pp", &grid, fill(&grid, posterior));
    write_map(&dir, "memory", &grid, fill(&grid, |i, j, k| -pattern(i, j, k)));
    write_map(&dir, "noise", &grid, fill(&grid, alternate_pattern));
    dir
}

/// Write every set in [`FIXTURE_SETS`] under `root`.
pub fn write_reference_library(root: &Path) {
    for name in FIXTURE_SETS {
        write_reference_set(root, name);
    }
}

/// Data of an input image perfectly correlated with `pain`.
pub fn input_image_data() -> Vec<f32> {
    fill(&reference_grid(), |i, j, k| 2.0 * pattern(i, j, k) + 0.5)
}

/// Write an input image (`.nii` or `.nii.gz` by extension) on the reference grid.
pub fn write_input_image(path: &Path) {
    write_volume(path, &reference_grid(), input_image_data());
}

/// Encoded bytes of the input image, gzip-compressed.
pub fn input_image_bytes() -> Vec<u8> {
    let volume = Volume::new(reference_grid(), input_image_data()).expect("fixture data matches grid");
    nifti::encode_gz(&volume).expect("encode fixture volume")
}
