//! Centralized default constants for nsweb.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration loaders fall back to these when an environment variable is
//! unset or unparsable.

// =============================================================================
// SPATIAL QUERIES
// =============================================================================

/// Radius used when a location query omits it (mm).
pub const SEARCH_RADIUS: f64 = 6.0;

/// Upper bound on any location query radius (mm). Larger requests are clamped.
pub const MAX_SEARCH_RADIUS: f64 = 20.0;

// =============================================================================
// DECODING
// =============================================================================

/// Reference set used when a request does not name one.
pub const DECODING_SET: &str = "terms_20k";

/// Suffix appended to the `terms` / `topics` shorthands.
pub const DECODING_SET_SHORTHAND_SUFFIX: &str = "_20k";

/// Largest accepted remote image, in bytes (inclusive).
pub const MAX_IMAGE_BYTES: u64 = 4_000_000;

/// Largest NIfTI header plus first frame a worker will inflate or decode.
pub const MAX_DECODED_IMAGE_BYTES: usize = 128 * 1024 * 1024;

/// Whether decodings are reused across requests.
pub const CACHE_DECODINGS: bool = true;

/// Reference collections accepted by voxel lookups; the first is the fallback.
pub const VOXEL_REFERENCES: [&str; 2] = ["terms", "topics"];

/// Voxel lookup memoization lifetime in seconds (1 hour).
pub const VOXEL_CACHE_TTL_SECS: u64 = 3600;

/// Maximum number of memoized voxel lookups.
pub const VOXEL_CACHE_CAPACITY: usize = 4096;

/// Maximum number of reference sets held in memory by a worker.
pub const REFERENCE_CACHE_CAPACITY: usize = 4;

/// Maximum points drawn in a scatterplot.
pub const SCATTER_MAX_POINTS: usize = 20_000;

/// Scatterplot edge length in pixels.
pub const SCATTER_SIZE_PX: u32 = 600;

// =============================================================================
// STORAGE
// =============================================================================

/// Directory for downloaded source images.
pub const DECODED_IMAGE_DIR: &str = "/var/lib/nsweb/decoded";

/// Directory for decoding result tables.
pub const DECODING_RESULTS_DIR: &str = "/var/lib/nsweb/results";

/// Directory for rendered scatterplots.
pub const DECODING_SCATTERPLOTS_DIR: &str = "/var/lib/nsweb/scatterplots";

/// Directory holding internal analysis images.
pub const IMAGE_DIR: &str = "/var/lib/nsweb/images";

/// Directory holding reference sets, one subdirectory per set.
pub const REFERENCE_DATA_DIR: &str = "/var/lib/nsweb/reference";

/// Mode for downloaded source images so worker processes can overwrite them.
pub const SOURCE_IMAGE_MODE: u32 = 0o666;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 5000;

/// NeuroVault REST API base URL.
pub const NEUROVAULT_API_URL: &str = "http://neurovault.org/api";

/// Timeout for outbound HTTP requests in seconds.
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// How long a request waits for a dispatched job before giving up.
pub const TASK_TIMEOUT_SECS: u64 = 300;

/// Maximum jobs executing at once in the worker pool.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Bounded submission queue length.
pub const JOB_QUEUE_CAPACITY: usize = 64;

/// Hard execution limit for a single job in seconds.
pub const JOB_TIMEOUT_SECS: u64 = 300;
