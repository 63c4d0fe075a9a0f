//! # nsweb-core
//!
//! Core types, traits, and abstractions for the nsweb decoding service.
//!
//! This crate provides the domain models (decodings, reference sets, studies,
//! peaks), the repository traits implemented by `nsweb-db`, job payloads
//! shared by the dispatcher and the worker, and the in-memory spatial index.

pub mod defaults;
pub mod error;
pub mod identity;
pub mod models;
pub mod spatial;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use identity::{
    basename, new_decoding_uuid, nifti_extension, normalize_url, resolve_set_name,
    validate_analysis_name, validate_decoding_uuid,
};
pub use models::*;
pub use spatial::{clamp_radius, PeakIndex};
pub use traits::*;
