//! # nsweb-jobs
//!
//! Task dispatch and numeric work for nsweb.
//!
//! This crate provides:
//! - A bounded worker pool with per-job timeouts and broadcast events
//! - The request-side [`TaskDispatcher`] with a mandatory wait timeout
//! - Handlers for voxel lookups, image decoding and scatterplot rendering
//! - A NIfTI-1 reader/writer and an LRU library of reference sets
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use nsweb_jobs::{decoding_worker, ReferenceLibrary, WorkerConfig};
//! use nsweb_db::ArtifactStore;
//!
//! let library = Arc::new(ReferenceLibrary::new("/var/lib/nsweb/reference"));
//! let artifacts = ArtifactStore::new("/data/decoded", "/data/results", "/data/scatter");
//!
//! let handle = decoding_worker(WorkerConfig::from_env(), library, artifacts)
//!     .build()
//!     .await
//!     .start();
//!
//! let dispatcher = handle.dispatcher(Duration::from_secs(300));
//! let rows = dispatcher.voxel_lookup("terms", 0, -52, 26, true).await?;
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

use std::sync::Arc;

pub mod decode;
pub mod dispatcher;
pub mod handler;
pub mod nifti;
pub mod reference;
pub mod scatter;
pub mod voxel;
pub mod worker;

// Always compiled so integration tests in other crates can build reference data
pub mod test_fixtures;

// Re-export core types
pub use nsweb_core::*;

pub use decode::DecodeHandler;
pub use dispatcher::{voxel_reference, TaskDispatcher};
pub use handler::{JobContext, JobHandler, JobResult};
pub use nifti::{NiftiError, Volume};
pub use reference::{ReferenceLibrary, ReferenceSet};
pub use scatter::ScatterHandler;
pub use voxel::VoxelHandler;
pub use worker::{JobWorker, Submission, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};

/// Builder preloaded with the voxel, decode and scatterplot handlers.
pub fn decoding_worker(
    config: WorkerConfig,
    library: Arc<ReferenceLibrary>,
    artifacts: nsweb_db::ArtifactStore,
) -> WorkerBuilder {
    WorkerBuilder::new()
        .with_config(config)
        .with_handler(VoxelHandler::new(library.clone()))
        .with_handler(DecodeHandler::new(library.clone(), artifacts))
        .with_handler(ScatterHandler::new(library))
}
