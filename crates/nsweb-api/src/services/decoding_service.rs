//! Decoding orchestration: identity resolution, caching policy, fetching,
//! dispatch and the lazy read paths.
//!
//! A decode request moves through
//! `REQUESTED -> CACHED | DOWNLOADING -> DECODING -> COMPLETE | FAILED`.
//! Requests for the same identity and set are serialized by an in-process
//! lock; the registry's atomic claim covers other processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use nsweb_core::{
    basename, new_decoding_uuid, nifti_extension, normalize_url, resolve_set_name,
    validate_analysis_name, Claim, Decoding, DecodingIdentity, DecodingRepository, DecodingResult,
    DecodingSet, DecodingSetRepository, DecodingStatus, Error, ImageRepository, NewDecoding,
    Result, ScatterplotPayload,
};
use nsweb_db::ArtifactStore;
use nsweb_jobs::TaskDispatcher;

use super::remote::{NeuroVaultImage, RemoteFetcher};

/// What the caller asked to decode.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeRequest {
    Url(String),
    NeuroVault(i64),
    Image(i64),
}

/// Result of a decode request.
#[derive(Debug, Clone)]
pub enum DecodeOutcome {
    /// The decoding record, whatever its status.
    Decoded(Decoding),
    /// NeuroVault has no downloadable file for the image.
    Missing,
}

/// One async mutex per key, dropped once nobody holds or waits on it.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: String) -> Result<OwnedMutexGuard<()>> {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| Error::Internal("keyed lock table poisoned".to_string()))?;
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(&key).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(AsyncMutex::new(()));
                    locks.insert(key, Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        Ok(mutex.lock_owned().await)
    }
}

/// Where the source image of a new decoding comes from.
enum Source {
    Remote {
        url: String,
        ext: &'static str,
        name: String,
        modified_at: Option<DateTime<Utc>>,
    },
    Local {
        path: PathBuf,
        name: String,
    },
}

fn remote_extension(url: &str) -> Result<&'static str> {
    match nifti_extension(url) {
        Some(".nii.gz") => Ok(".nii.gz"),
        Some(_) => Ok(".nii"),
        None => Err(Error::Validation(
            "The requested file does not appear to be a NIfTI image (.nii or .nii.gz)".to_string(),
        )),
    }
}

/// Registry, artifacts, fetcher and dispatcher behind the decode endpoints.
pub struct DecodingService {
    decodings: Arc<dyn DecodingRepository>,
    decoding_sets: Arc<dyn DecodingSetRepository>,
    images: Arc<dyn ImageRepository>,
    artifacts: ArtifactStore,
    dispatcher: TaskDispatcher,
    fetcher: RemoteFetcher,
    cache_decodings: bool,
    default_set: String,
    image_dir: PathBuf,
    identity_locks: KeyedLocks,
    scatter_locks: KeyedLocks,
}

impl DecodingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        decodings: Arc<dyn DecodingRepository>,
        decoding_sets: Arc<dyn DecodingSetRepository>,
        images: Arc<dyn ImageRepository>,
        artifacts: ArtifactStore,
        dispatcher: TaskDispatcher,
        fetcher: RemoteFetcher,
        cache_decodings: bool,
        default_set: impl Into<String>,
        image_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            decodings,
            decoding_sets,
            images,
            artifacts,
            dispatcher,
            fetcher,
            cache_decodings,
            default_set: default_set.into(),
            image_dir: image_dir.into(),
            identity_locks: KeyedLocks::default(),
            scatter_locks: KeyedLocks::default(),
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub async fn list_sets(&self) -> Result<Vec<DecodingSet>> {
        self.decoding_sets.list().await
    }

    async fn resolve_set(&self, requested: Option<&str>) -> Result<DecodingSet> {
        let name = resolve_set_name(requested, &self.default_set);
        self.decoding_sets
            .get_by_name(&name)
            .await?
            .ok_or_else(|| Error::Validation(format!("Unknown decoding set: {}", name)))
    }

    // ─── Decode ────────────────────────────────────────────────────────────

    /// Decode an image, reusing an existing decoding when policy allows.
    ///
    /// Validation and fetch errors are returned before anything is
    /// dispatched. A failed decode still returns its (failed) record.
    pub async fn decode(
        &self,
        request: DecodeRequest,
        set: Option<&str>,
        ip: Option<String>,
    ) -> Result<DecodeOutcome> {
        let set = self.resolve_set(set).await?;
        let identity = match request {
            DecodeRequest::Url(url) => {
                let url = normalize_url(&url);
                remote_extension(&url)?;
                DecodingIdentity::Url(url)
            }
            DecodeRequest::NeuroVault(id) => DecodingIdentity::NeuroVault(id),
            DecodeRequest::Image(id) => DecodingIdentity::Image(id),
        };

        let _guard = self
            .identity_locks
            .lock(format!("{}|{}", identity.key(), set.id))
            .await?;

        if let Some(existing) = self.resolve_existing(&identity, &set).await? {
            debug!(
                subsystem = "api",
                component = "decoder",
                op = "decode",
                identity_key = %identity,
                decoding_uuid = %existing.uuid,
                status = existing.status.as_str(),
                "Reusing cached decoding"
            );
            return Ok(DecodeOutcome::Decoded(existing));
        }

        let source = match &identity {
            DecodingIdentity::Url(url) => self.remote_source(url.clone(), None, None).await?,
            DecodingIdentity::NeuroVault(id) => match self.fetcher.neurovault_image(*id).await? {
                NeuroVaultImage::Missing => return Ok(DecodeOutcome::Missing),
                NeuroVaultImage::Found {
                    file,
                    name,
                    modified_at,
                } => self.remote_source(normalize_url(&file), name, modified_at).await?,
            },
            DecodingIdentity::Image(id) => {
                let image = self
                    .images
                    .get(*id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("image {}", id)))?;
                Source::Local {
                    path: self.image_dir.join(&image.image_file),
                    name: image.name,
                }
            }
        };

        self.create(identity, set, source, ip)
            .await
            .map(DecodeOutcome::Decoded)
    }

    /// Existing decoding for an identity after applying the caching policy.
    ///
    /// With caching disabled, or when the match failed, the row and its
    /// artifacts are removed and the identity is treated as absent.
    async fn resolve_existing(
        &self,
        identity: &DecodingIdentity,
        set: &DecodingSet,
    ) -> Result<Option<Decoding>> {
        let Some(existing) = self.decodings.find(identity, set.id).await? else {
            return Ok(None);
        };
        if self.cache_decodings && existing.status != DecodingStatus::Failed {
            return Ok(Some(existing));
        }
        info!(
            subsystem = "api",
            component = "decoder",
            op = "discard",
            decoding_uuid = %existing.uuid,
            status = existing.status.as_str(),
            cache_decodings = self.cache_decodings,
            "Discarding previous decoding"
        );
        self.discard(&existing).await?;
        Ok(None)
    }

    async fn discard(&self, decoding: &Decoding) -> Result<()> {
        self.decodings.delete(decoding.id).await?;
        self.artifacts.remove_all(decoding).await
    }

    /// HEAD a remote image and collect what the new decoding needs.
    async fn remote_source(
        &self,
        url: String,
        name: Option<String>,
        modified_at: Option<DateTime<Utc>>,
    ) -> Result<Source> {
        let ext = remote_extension(&url)?;
        let head = self.fetcher.head(&url).await?;
        Ok(Source::Remote {
            name: name.unwrap_or_else(|| basename(&url).to_string()),
            modified_at: modified_at.or(head.last_modified),
            ext,
            url,
        })
    }

    async fn create(
        &self,
        identity: DecodingIdentity,
        set: DecodingSet,
        source: Source,
        ip: Option<String>,
    ) -> Result<Decoding> {
        let (name, filename, modified_at) = match &source {
            Source::Remote {
                name, modified_at, ..
            } => (name.clone(), String::new(), *modified_at),
            Source::Local { path, name } => {
                (name.clone(), path.to_string_lossy().into_owned(), None)
            }
        };

        let claim = self
            .decodings
            .claim(NewDecoding {
                uuid: new_decoding_uuid(),
                identity,
                decoding_set: set,
                name,
                display: true,
                download: false,
                ip,
                image_modified_at: modified_at,
                filename,
            })
            .await?;
        let mut decoding = match claim {
            Claim::Created(d) => d,
            Claim::Existing(d) => {
                debug!(
                    subsystem = "api",
                    component = "decoder",
                    op = "claim",
                    decoding_uuid = %d.uuid,
                    "Identity claimed by another request"
                );
                return Ok(d);
            }
        };

        if let Source::Remote { url, ext, .. } = &source {
            match self.store_remote(&decoding, url, ext).await {
                Ok(path) => {
                    let path = path.to_string_lossy().into_owned();
                    self.decodings.set_filename(decoding.id, &path).await?;
                    decoding.filename = path;
                }
                Err(e) => {
                    warn!(
                        subsystem = "api",
                        component = "decoder",
                        op = "download",
                        decoding_uuid = %decoding.uuid,
                        error = %e,
                        "Download failed, dropping claimed decoding"
                    );
                    self.discard(&decoding).await?;
                    return Err(e);
                }
            }
        }

        self.run_decode(decoding).await
    }

    async fn store_remote(&self, decoding: &Decoding, url: &str, ext: &str) -> Result<PathBuf> {
        let body = self.fetcher.download(url).await?;
        self.artifacts
            .store_source_image(&decoding.uuid, ext, &body)
            .await
    }

    async fn run_decode(&self, decoding: Decoding) -> Result<Decoding> {
        let start = Instant::now();
        match self
            .dispatcher
            .decode_image(&decoding.filename, &decoding.decoding_set, &decoding.uuid)
            .await
        {
            Ok(_) => {
                self.decodings.mark_complete(decoding.id, Utc::now()).await?;
                info!(
                    subsystem = "api",
                    component = "decoder",
                    op = "decode",
                    decoding_uuid = %decoding.uuid,
                    decoding_set = %decoding.decoding_set,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Decoding complete"
                );
            }
            Err(e) => {
                warn!(
                    subsystem = "api",
                    component = "decoder",
                    op = "decode",
                    decoding_uuid = %decoding.uuid,
                    error = %e,
                    "Decoding failed"
                );
                self.decodings.mark_failed(decoding.id, &e.to_string()).await?;
            }
        }
        self.get(&decoding.uuid).await
    }

    // ─── Read paths ────────────────────────────────────────────────────────

    pub async fn get(&self, uuid: &str) -> Result<Decoding> {
        self.decodings
            .get_by_uuid(uuid)
            .await?
            .ok_or_else(|| Error::NotFound(format!("decoding {}", uuid)))
    }

    /// Result table of a completed decoding.
    pub async fn data(&self, uuid: &str) -> Result<Vec<DecodingResult>> {
        let decoding = self.get(uuid).await?;
        if !decoding.is_complete() {
            return Err(Error::NotFound(format!("decoding {} is not ready", uuid)));
        }
        self.artifacts.read_results(&decoding.uuid).await
    }

    /// Source image bytes and the filename offered for download.
    pub async fn image(&self, uuid: &str) -> Result<(Vec<u8>, String)> {
        let decoding = self.get(uuid).await?;
        if decoding.filename.is_empty() {
            return Err(Error::NotFound(format!("image for decoding {}", uuid)));
        }
        let bytes = self.artifacts.read_source_image(&decoding).await?;
        Ok((bytes, basename(&decoding.filename).to_string()))
    }

    /// Scatterplot PNG of a decoding against one analysis, rendered on
    /// first request. Artifact names come from the registry row, never from
    /// the request path.
    pub async fn scatterplot(&self, uuid: &str, analysis: &str) -> Result<Vec<u8>> {
        validate_analysis_name(analysis)?;
        let decoding = self.get(uuid).await?;
        let uuid = decoding.uuid.as_str();
        if self.artifacts.has_scatterplot(uuid, analysis).await? {
            return self.artifacts.read_scatterplot(uuid, analysis).await;
        }

        let _guard = self
            .scatter_locks
            .lock(format!("{}|{}", uuid, analysis))
            .await?;
        if self.artifacts.has_scatterplot(uuid, analysis).await? {
            return self.artifacts.read_scatterplot(uuid, analysis).await;
        }

        if decoding.filename.is_empty() {
            return Err(Error::NotFound(format!("image for decoding {}", uuid)));
        }
        let output = self.artifacts.scatterplot_path(uuid, analysis)?;
        let payload = ScatterplotPayload {
            image_path: decoding.filename.clone(),
            decoding_set: decoding.decoding_set.clone(),
            analysis: analysis.to_string(),
            decoding_uuid: decoding.uuid.clone(),
            output_path: path_string(&output),
            x_label: decoding.name.clone(),
        };
        if let Err(e) = self.dispatcher.render_scatterplot(payload).await {
            warn!(
                subsystem = "api",
                component = "decoder",
                op = "render_scatterplot",
                decoding_uuid = %uuid,
                analysis = %analysis,
                error = %e,
                "Scatterplot rendering failed"
            );
            return Err(Error::NotFound(format!(
                "scatterplot for {} against {}",
                uuid, analysis
            )));
        }
        self.artifacts.read_scatterplot(uuid, analysis).await
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
