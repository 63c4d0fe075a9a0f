//! Filesystem artifact storage for decodings.
//!
//! Three directories hold everything a decoding produces:
//! - source images: `{uuid}.nii` / `{uuid}.nii.gz`
//! - result tables: `{uuid}.txt`, one `analysis\tscore` line per map
//! - scatterplots: `{uuid}_{analysis}.png`
//!
//! Writes go through a temp file and a rename so readers never observe a
//! partially written artifact.
//!
//! ## Example
//!
//! ```rust,ignore
//! use nsweb_db::artifacts::ArtifactStore;
//!
//! let store = ArtifactStore::new("/var/lib/nsweb/decoded", "/var/lib/nsweb/results", "/var/lib/nsweb/scatterplots");
//! let path = store.store_source_image(&uuid, ".nii.gz", &bytes).await?;
//! let rows = store.read_results(&uuid).await?;
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use nsweb_core::defaults::SOURCE_IMAGE_MODE;
use nsweb_core::{
    validate_analysis_name, validate_decoding_uuid, Decoding, DecodingResult, Error, Result,
};

/// Mode applied to result tables and scatterplots.
pub const ARTIFACT_MODE: u32 = 0o644;

/// Storage backend trait for different storage implementations.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write data to the specified path.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read data from the specified path. Missing data is `Error::NotFound`.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete data at the specified path. Missing data is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if data exists at the specified path.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Names of stored entries starting with `prefix`.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Absolute location of a stored entry, handed to worker jobs.
    fn locate(&self, path: &str) -> PathBuf;
}

/// Filesystem storage backend rooted at a single directory.
pub struct FilesystemBackend {
    base_path: PathBuf,
    mode: u32,
}

impl FilesystemBackend {
    /// Create a new filesystem backend with the given base directory.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            mode: ARTIFACT_MODE,
        }
    }

    /// Permission bits applied to every written file.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    /// Check the directory can be written, read and cleaned up.
    pub async fn validate(&self) -> std::result::Result<(), String> {
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| format!("create_dir_all({:?}): {}", self.base_path, e))?;

        let marker = self.base_path.join(".health-check");
        let data = b"storage-health-check";
        fs::write(&marker, data)
            .await
            .map_err(|e| format!("write({:?}): {}", marker, e))?;
        let read_back = fs::read(&marker)
            .await
            .map_err(|e| format!("read({:?}): {}", marker, e))?;
        if read_back != data {
            return Err("read-back mismatch".to_string());
        }
        fs::remove_file(&marker)
            .await
            .map_err(|e| format!("remove_file({:?}): {}", marker, e))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        debug!(
            subsystem = "storage",
            component = "artifacts",
            storage_path = %path,
            size_bytes = data.len(),
            "artifacts: write"
        );
        write_atomic(&self.full_path(path), data, self.mode).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        read_file(&self.full_path(path)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)).await?)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn locate(&self, path: &str) -> PathBuf {
        self.full_path(path)
    }
}

/// Write `data` to `full_path` through a sibling temp file and a rename.
pub async fn write_atomic(full_path: &Path, data: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            warn!(parent = %parent.display(), error = %e, "artifacts: create_dir_all failed");
            e
        })?;
    }

    let file_name = full_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Internal(format!("invalid artifact path {}", full_path.display())))?;
    let temp_path = full_path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = fs::File::create(&temp_path).await.map_err(|e| {
        warn!(temp_path = %temp_path.display(), error = %e, "artifacts: File::create failed");
        e
    })?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    fs::rename(&temp_path, full_path).await.map_err(|e| {
        warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "artifacts: rename failed");
        e
    })?;
    Ok(())
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(Error::NotFound(format!("artifact {}", path.display())))
        }
        Err(e) => Err(e.into()),
    }
}

/// Parse a result table, skipping rows without a value and rounding to 3 dp.
pub fn parse_results(text: &str) -> Vec<DecodingResult> {
    text.lines()
        .filter_map(|line| {
            let (analysis, value) = line.split_once('\t')?;
            let value = value.trim();
            if value.is_empty() {
                return None;
            }
            match value.parse::<f64>() {
                Ok(r) if r.is_finite() => Some(DecodingResult {
                    analysis: analysis.to_string(),
                    r: round3(r),
                }),
                _ => {
                    warn!(analysis = %analysis, value = %value, "artifacts: unparsable score skipped");
                    None
                }
            }
        })
        .collect()
}

/// Render a result table in stored order.
pub fn format_results(rows: &[DecodingResult]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&row.analysis);
        out.push('\t');
        if row.r.is_finite() {
            out.push_str(&row.r.to_string());
        }
        out.push('\n');
    }
    out
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Artifact store over the three decoding directories.
#[derive(Clone)]
pub struct ArtifactStore {
    images: Arc<dyn StorageBackend>,
    results: Arc<dyn StorageBackend>,
    scatterplots: Arc<dyn StorageBackend>,
}

impl ArtifactStore {
    /// Filesystem store; source images are written group/world writable.
    pub fn new(
        decoded_dir: impl Into<PathBuf>,
        results_dir: impl Into<PathBuf>,
        scatterplots_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::with_backends(
            Arc::new(FilesystemBackend::new(decoded_dir).with_mode(SOURCE_IMAGE_MODE)),
            Arc::new(FilesystemBackend::new(results_dir)),
            Arc::new(FilesystemBackend::new(scatterplots_dir)),
        )
    }

    pub fn with_backends(
        images: Arc<dyn StorageBackend>,
        results: Arc<dyn StorageBackend>,
        scatterplots: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            images,
            results,
            scatterplots,
        }
    }

    // ─── Source images ─────────────────────────────────────────────────────

    fn source_image_name(uuid: &str, ext: &str) -> Result<String> {
        validate_decoding_uuid(uuid)?;
        if !matches!(ext, ".nii" | ".nii.gz") {
            return Err(Error::Validation(format!("Invalid image extension: {:?}", ext)));
        }
        Ok(format!("{}{}", uuid, ext))
    }

    /// Where a downloaded image for `uuid` is stored.
    pub fn source_image_path(&self, uuid: &str, ext: &str) -> Result<PathBuf> {
        Ok(self.images.locate(&Self::source_image_name(uuid, ext)?))
    }

    /// Store downloaded image bytes and return the full path.
    pub async fn store_source_image(&self, uuid: &str, ext: &str, data: &[u8]) -> Result<PathBuf> {
        let name = Self::source_image_name(uuid, ext)?;
        self.images.write(&name, data).await?;
        Ok(self.images.locate(&name))
    }

    /// Read a decoding's source image from its recorded path.
    pub async fn read_source_image(&self, decoding: &Decoding) -> Result<Vec<u8>> {
        read_file(Path::new(&decoding.filename)).await
    }

    /// True when `path` lies inside the decoded images directory.
    pub fn is_owned_source(&self, path: &Path) -> bool {
        let dir = self.images.locate("");
        path.parent().map_or(false, |parent| parent == dir.as_path())
    }

    // ─── Result tables ─────────────────────────────────────────────────────

    fn result_name(uuid: &str) -> Result<String> {
        validate_decoding_uuid(uuid)?;
        Ok(format!("{}.txt", uuid))
    }

    pub fn result_path(&self, uuid: &str) -> Result<PathBuf> {
        Ok(self.results.locate(&Self::result_name(uuid)?))
    }

    pub async fn has_results(&self, uuid: &str) -> Result<bool> {
        self.results.exists(&Self::result_name(uuid)?).await
    }

    pub async fn write_results(&self, uuid: &str, rows: &[DecodingResult]) -> Result<()> {
        self.results
            .write(&Self::result_name(uuid)?, format_results(rows).as_bytes())
            .await
    }

    pub async fn read_results(&self, uuid: &str) -> Result<Vec<DecodingResult>> {
        let data = self.results.read(&Self::result_name(uuid)?).await?;
        let text = String::from_utf8(data)
            .map_err(|e| Error::Internal(format!("result table for {} is not UTF-8: {}", uuid, e)))?;
        Ok(parse_results(&text))
    }

    // ─── Scatterplots ──────────────────────────────────────────────────────

    fn scatterplot_name(uuid: &str, analysis: &str) -> Result<String> {
        validate_decoding_uuid(uuid)?;
        validate_analysis_name(analysis)?;
        Ok(format!("{}_{}.png", uuid, analysis))
    }

    pub fn scatterplot_path(&self, uuid: &str, analysis: &str) -> Result<PathBuf> {
        Ok(self.scatterplots.locate(&Self::scatterplot_name(uuid, analysis)?))
    }

    pub async fn has_scatterplot(&self, uuid: &str, analysis: &str) -> Result<bool> {
        self.scatterplots
            .exists(&Self::scatterplot_name(uuid, analysis)?)
            .await
    }

    pub async fn write_scatterplot(&self, uuid: &str, analysis: &str, png: &[u8]) -> Result<()> {
        self.scatterplots
            .write(&Self::scatterplot_name(uuid, analysis)?, png)
            .await
    }

    pub async fn read_scatterplot(&self, uuid: &str, analysis: &str) -> Result<Vec<u8>> {
        self.scatterplots
            .read(&Self::scatterplot_name(uuid, analysis)?)
            .await
    }

    // ─── Cleanup ───────────────────────────────────────────────────────────

    /// Delete every artifact owned by a decoding.
    ///
    /// The source image is removed only when it was downloaded into the
    /// decoded images directory; internal analysis images are left alone.
    pub async fn remove_all(&self, decoding: &Decoding) -> Result<()> {
        let source = Path::new(&decoding.filename);
        if self.is_owned_source(source) {
            if let Some(name) = source.file_name().and_then(|n| n.to_str()) {
                self.images.delete(name).await?;
            }
        }

        self.results.delete(&Self::result_name(&decoding.uuid)?).await?;

        let prefix = format!("{}_", decoding.uuid);
        let plots = self.scatterplots.list_prefix(&prefix).await?;
        for name in &plots {
            self.scatterplots.delete(name).await?;
        }

        debug!(
            subsystem = "storage",
            component = "artifacts",
            op = "remove_all",
            decoding_uuid = %decoding.uuid,
            scatterplot_count = plots.len(),
            "Removed decoding artifacts"
        );
        Ok(())
    }
}
