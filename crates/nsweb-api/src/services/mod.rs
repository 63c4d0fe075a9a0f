//! Service layer for business logic.

pub mod decoding_service;
pub mod remote;
pub mod voxel_cache;

pub use decoding_service::{DecodeOutcome, DecodeRequest, DecodingService};
pub use remote::{NeuroVaultImage, RemoteFetcher, RemoteHead};
pub use voxel_cache::{CacheStats, VoxelCache, VoxelKey};
