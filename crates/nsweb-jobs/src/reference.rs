//! Reference map library.
//!
//! A reference set is a directory of NIfTI maps sharing one grid:
//! `<analysis>.nii[.gz]` holds the reverse-inference map for an analysis and
//! `<analysis>_pp.nii[.gz]` its optional posterior-probability map. Loaded
//! sets are kept in a small LRU so repeated jobs skip the disk.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::{debug, info, warn};

use nsweb_core::{defaults, Error, Result};

use crate::nifti::{self, Grid};

const POSTERIOR_SUFFIX: &str = "_pp";

/// One analysis in a reference set.
#[derive(Debug, Clone)]
pub struct ReferenceMap {
    pub analysis: String,
    pub values: Vec<f32>,
    pub posterior: Option<Vec<f32>>,
}

/// All maps of a reference set, on a shared grid, sorted by analysis name.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    pub name: String,
    pub grid: Grid,
    pub maps: Vec<ReferenceMap>,
}

/// Split a NIfTI file name into its stem, if it has a NIfTI extension.
fn nifti_stem(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(".nii.gz")
        .or_else(|| file_name.strip_suffix(".nii"))
        .filter(|stem| !stem.is_empty())
}

impl ReferenceSet {
    /// Load every map in `dir`.
    pub fn load(name: &str, dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("reference set {}", name)));
        }

        let mut files: Vec<(String, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = nifti_stem(&file_name) {
                files.push((stem.to_string(), entry.path()));
            }
        }
        files.sort();

        let mut grid: Option<Grid> = None;
        let mut maps: BTreeMap<String, Vec<f32>> = BTreeMap::new();
        let mut posteriors: BTreeMap<String, Vec<f32>> = BTreeMap::new();

        for (stem, path) in files {
            let volume = nifti::read_file(&path)?;
            match &grid {
                None => grid = Some(volume.grid.clone()),
                Some(g) if *g != volume.grid => {
                    return Err(Error::Validation(format!(
                        "reference map {} does not share the grid of set {}",
                        path.display(),
                        name
                    )));
                }
                Some(_) => {}
            }
            match stem.strip_suffix(POSTERIOR_SUFFIX) {
                Some(analysis) if !analysis.is_empty() => {
                    posteriors.insert(analysis.to_string(), volume.data);
                }
                _ => {
                    maps.insert(stem, volume.data);
                }
            }
        }

        let grid = match grid {
            Some(grid) if !maps.is_empty() => grid,
            _ => return Err(Error::NotFound(format!("reference set {} has no maps", name))),
        };

        for orphan in posteriors.keys().filter(|a| !maps.contains_key(*a)) {
            warn!(
                subsystem = "jobs",
                component = "reference",
                set = %name,
                analysis = %orphan,
                "Posterior map without a matching reference map ignored"
            );
        }

        let maps = maps
            .into_iter()
            .map(|(analysis, values)| {
                let posterior = posteriors.remove(&analysis);
                ReferenceMap {
                    analysis,
                    values,
                    posterior,
                }
            })
            .collect();

        Ok(Self {
            name: name.to_string(),
            grid,
            maps,
        })
    }

    pub fn get(&self, analysis: &str) -> Option<&ReferenceMap> {
        self.maps
            .binary_search_by(|m| m.analysis.as_str().cmp(analysis))
            .ok()
            .map(|idx| &self.maps[idx])
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

/// LRU of loaded reference sets rooted at a data directory.
///
/// Lookups read from disk on a miss, so call them from blocking context.
pub struct ReferenceLibrary {
    root: PathBuf,
    cache: Mutex<LruCache<String, Arc<ReferenceSet>>>,
}

impl ReferenceLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_capacity(root, defaults::REFERENCE_CACHE_CAPACITY)
    }

    pub fn with_capacity(root: impl Into<PathBuf>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            root: root.into(),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fetch a set by name, loading it on first use.
    pub fn get(&self, name: &str) -> Result<Arc<ReferenceSet>> {
        if name.is_empty() || name.contains(|c| c == '/' || c == '\\') || name.contains("..") {
            return Err(Error::Validation(format!("invalid reference set name: {:?}", name)));
        }

        if let Some(set) = self.lock()?.get(name) {
            debug!(subsystem = "jobs", component = "reference", set = %name, "Reference cache hit");
            return Ok(set.clone());
        }

        let start = std::time::Instant::now();
        let set = Arc::new(ReferenceSet::load(name, &self.root.join(name))?);
        info!(
            subsystem = "jobs",
            component = "reference",
            set = %name,
            maps = set.len(),
            voxels = set.grid.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Reference set loaded"
        );
        self.lock()?.put(name.to_string(), set.clone());
        Ok(set)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, Arc<ReferenceSet>>>> {
        self.cache
            .lock()
            .map_err(|_| Error::Internal("reference cache lock poisoned".to_string()))
    }
}
