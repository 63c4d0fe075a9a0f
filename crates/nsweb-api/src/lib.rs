//! # nsweb-api
//!
//! HTTP surface of the nsweb decoding service.
//!
//! The binary builds one [`AppState`] at startup and hands it to
//! [`build_router`]. Integration tests build the same state over the
//! in-memory store.

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use nsweb_core::{
    DecodingRepository, DecodingSetRepository, ImageRepository, PeakRepository, Result,
};
use nsweb_db::{ArtifactStore, Database, MemoryStore};
use nsweb_jobs::TaskDispatcher;

pub mod config;
pub mod error;
pub mod handlers;
pub mod services;

pub use config::AppConfig;
pub use error::ApiError;

use services::{DecodingService, RemoteFetcher, VoxelCache};

/// The repositories a server runs against.
#[derive(Clone)]
pub struct Repositories {
    pub decodings: Arc<dyn DecodingRepository>,
    pub decoding_sets: Arc<dyn DecodingSetRepository>,
    pub peaks: Arc<dyn PeakRepository>,
    pub images: Arc<dyn ImageRepository>,
}

impl Repositories {
    pub fn from_database(db: Database) -> Self {
        Self {
            decodings: Arc::new(db.decodings),
            decoding_sets: Arc::new(db.decoding_sets),
            peaks: Arc::new(db.peaks),
            images: Arc::new(db.images),
        }
    }

    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            decodings: store.clone(),
            decoding_sets: store.clone(),
            peaks: store.clone(),
            images: store,
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub decoder: Arc<DecodingService>,
    pub peaks: Arc<dyn PeakRepository>,
    pub images: Arc<dyn ImageRepository>,
    pub voxels: Arc<VoxelCache>,
    pub dispatcher: TaskDispatcher,
}

impl AppState {
    pub fn new(config: &AppConfig, repos: Repositories, dispatcher: TaskDispatcher) -> Result<Self> {
        config.validate()?;
        let artifacts = ArtifactStore::new(
            &config.decoded_image_dir,
            &config.results_dir,
            &config.scatterplots_dir,
        );
        let fetcher = RemoteFetcher::new(
            &config.neurovault_api_url,
            config.max_image_bytes,
            config.http_timeout,
        )?;
        let decoder = DecodingService::new(
            repos.decodings,
            repos.decoding_sets,
            repos.images.clone(),
            artifacts,
            dispatcher.clone(),
            fetcher,
            config.cache_decodings,
            config.default_decoding_set.clone(),
            config.image_dir.clone(),
        );
        Ok(Self {
            decoder: Arc::new(decoder),
            peaks: repos.peaks,
            images: repos.images,
            voxels: Arc::new(VoxelCache::new(
                config.voxel_cache_capacity,
                config.voxel_cache_ttl,
            )),
            dispatcher,
        })
    }
}

/// All HTTP routes.
pub fn build_router(state: AppState) -> Router {
    use handlers::{decode, health, locations};

    Router::new()
        .route("/health", get(health::health_check))
        .route("/decode/", get(decode::decode_index))
        .route("/decode/data/", get(decode::decode_data))
        .route("/decode/:uuid/", get(decode::show_decoding))
        .route("/decode/:uuid/data", get(decode::decoding_data))
        .route("/decode/:uuid/image", get(decode::decoding_image))
        .route(
            "/decode/:uuid/scatter/:analysis",
            get(decode::decoding_scatterplot),
        )
        .route("/api/locations/:coords/", get(locations::studies_near))
        .route("/api/locations/:coords/values", get(locations::voxel_values))
        .route("/studies/:coords", get(locations::studies_near))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
