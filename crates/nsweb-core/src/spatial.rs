//! In-memory spatial index over activation peaks.
//!
//! Queries run in two phases: an axis-aligned bounding box prefilter (a
//! binary-searched range on `x`, then `y`/`z` checks) followed by the exact
//! squared-distance test. Matches are grouped per study in pmid order.

use std::collections::{BTreeMap, HashMap};

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::{Peak, Study, StudyPeakCount};

/// Apply the default and the upper bound to a requested search radius.
pub fn clamp_radius(radius: Option<f64>) -> Result<f64> {
    let radius = radius.unwrap_or(defaults::SEARCH_RADIUS);
    if !radius.is_finite() || radius < 0.0 {
        return Err(Error::Validation(format!("Invalid radius: {}", radius)));
    }
    Ok(radius.min(defaults::MAX_SEARCH_RADIUS))
}

/// Peaks sorted by `x` plus the studies they belong to.
#[derive(Debug, Clone, Default)]
pub struct PeakIndex {
    peaks: Vec<Peak>,
    studies: HashMap<i64, Study>,
}

impl PeakIndex {
    /// Build an index. Peaks whose study is unknown are dropped.
    pub fn new(peaks: Vec<Peak>, studies: Vec<Study>) -> Self {
        let studies: HashMap<i64, Study> = studies.into_iter().map(|s| (s.pmid, s)).collect();
        let mut peaks: Vec<Peak> = peaks
            .into_iter()
            .filter(|p| studies.contains_key(&p.pmid))
            .filter(|p| p.x.is_finite() && p.y.is_finite() && p.z.is_finite())
            .collect();
        peaks.sort_by(|a, b| a.x.total_cmp(&b.x));
        Self { peaks, studies }
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn study(&self, pmid: i64) -> Option<&Study> {
        self.studies.get(&pmid)
    }

    /// Studies with at least one peak within `radius` of `(x, y, z)`.
    ///
    /// The radius is clamped to the configured maximum. Results are ordered
    /// by pmid ascending.
    pub fn find_nearby(&self, x: f64, y: f64, z: f64, radius: f64) -> Result<Vec<StudyPeakCount>> {
        let r = clamp_radius(Some(radius))?;
        let r2 = r * r;

        let start = self.peaks.partition_point(|p| p.x < x - r);
        let end = self.peaks.partition_point(|p| p.x <= x + r);

        let mut counts: BTreeMap<i64, i64> = BTreeMap::new();
        for peak in &self.peaks[start..end] {
            if (peak.y - y).abs() > r || (peak.z - z).abs() > r {
                continue;
            }
            let (dx, dy, dz) = (peak.x - x, peak.y - y, peak.z - z);
            if dx * dx + dy * dy + dz * dz <= r2 {
                *counts.entry(peak.pmid).or_insert(0) += 1;
            }
        }

        Ok(counts
            .into_iter()
            .filter_map(|(pmid, peaks)| {
                self.studies.get(&pmid).map(|study| StudyPeakCount {
                    study: study.clone(),
                    peaks,
                })
            })
            .collect())
    }
}
