//! Server configuration read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use nsweb_core::{defaults, Error, Result};

/// `DATABASE_URL` value selecting the in-memory store instead of PostgreSQL.
pub const MEMORY_DATABASE_URL: &str = "memory";

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    /// Reuse decodings across requests; when false every request recomputes.
    pub cache_decodings: bool,
    pub decoded_image_dir: PathBuf,
    pub results_dir: PathBuf,
    pub scatterplots_dir: PathBuf,
    pub image_dir: PathBuf,
    pub reference_data_dir: PathBuf,
    pub default_decoding_set: String,
    pub neurovault_api_url: String,
    /// Largest accepted remote image, inclusive.
    pub max_image_bytes: u64,
    /// How long a request waits for a dispatched job.
    pub task_timeout: Duration,
    pub voxel_cache_ttl: Duration,
    pub voxel_cache_capacity: usize,
    pub http_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/nsweb".to_string(),
            host: "0.0.0.0".to_string(),
            port: defaults::SERVER_PORT,
            cache_decodings: defaults::CACHE_DECODINGS,
            decoded_image_dir: PathBuf::from(defaults::DECODED_IMAGE_DIR),
            results_dir: PathBuf::from(defaults::DECODING_RESULTS_DIR),
            scatterplots_dir: PathBuf::from(defaults::DECODING_SCATTERPLOTS_DIR),
            image_dir: PathBuf::from(defaults::IMAGE_DIR),
            reference_data_dir: PathBuf::from(defaults::REFERENCE_DATA_DIR),
            default_decoding_set: defaults::DECODING_SET.to_string(),
            neurovault_api_url: defaults::NEUROVAULT_API_URL.to_string(),
            max_image_bytes: defaults::MAX_IMAGE_BYTES,
            task_timeout: Duration::from_secs(defaults::TASK_TIMEOUT_SECS),
            voxel_cache_ttl: Duration::from_secs(defaults::VOXEL_CACHE_TTL_SECS),
            voxel_cache_capacity: defaults::VOXEL_CACHE_CAPACITY,
            http_timeout: Duration::from_secs(defaults::HTTP_TIMEOUT_SECS),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| v != "false" && v != "0")
}

impl AppConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DATABASE_URL` | `postgres://localhost/nsweb` (`memory` for the in-memory store) |
    /// | `HOST` / `PORT` | `0.0.0.0` / `5000` |
    /// | `CACHE_DECODINGS` | `true` |
    /// | `DECODED_IMAGE_DIR`, `DECODING_RESULTS_DIR`, `DECODING_SCATTERPLOTS_DIR` | under `/var/lib/nsweb` |
    /// | `IMAGE_DIR`, `REFERENCE_DATA_DIR` | under `/var/lib/nsweb` |
    /// | `DEFAULT_DECODING_SET` | `terms_20k` |
    /// | `NEUROVAULT_API_URL` | `http://neurovault.org/api` |
    /// | `MAX_IMAGE_BYTES` | `4000000` |
    /// | `TASK_TIMEOUT_SECS` | `300` |
    /// | `VOXEL_CACHE_TTL_SECS` / `VOXEL_CACHE_CAPACITY` | `3600` / `4096` |
    /// | `HTTP_TIMEOUT_SECS` | `30` |
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            database_url: env_string("DATABASE_URL").unwrap_or(d.database_url),
            host: env_string("HOST").unwrap_or(d.host),
            port: env_parse("PORT").unwrap_or(d.port),
            cache_decodings: env_bool("CACHE_DECODINGS").unwrap_or(d.cache_decodings),
            decoded_image_dir: env_string("DECODED_IMAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.decoded_image_dir),
            results_dir: env_string("DECODING_RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.results_dir),
            scatterplots_dir: env_string("DECODING_SCATTERPLOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.scatterplots_dir),
            image_dir: env_string("IMAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.image_dir),
            reference_data_dir: env_string("REFERENCE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.reference_data_dir),
            default_decoding_set: env_string("DEFAULT_DECODING_SET")
                .unwrap_or(d.default_decoding_set),
            neurovault_api_url: env_string("NEUROVAULT_API_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(d.neurovault_api_url),
            max_image_bytes: env_parse("MAX_IMAGE_BYTES").unwrap_or(d.max_image_bytes),
            task_timeout: env_parse("TASK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.task_timeout),
            voxel_cache_ttl: env_parse("VOXEL_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.voxel_cache_ttl),
            voxel_cache_capacity: env_parse::<usize>("VOXEL_CACHE_CAPACITY")
                .unwrap_or(d.voxel_cache_capacity)
                .max(1),
            http_timeout: env_parse("HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.http_timeout),
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_image_bytes == 0 {
            return Err(Error::Config("MAX_IMAGE_BYTES must be positive".to_string()));
        }
        if self.task_timeout.is_zero() {
            return Err(Error::Config("TASK_TIMEOUT_SECS must be positive".to_string()));
        }
        if self.default_decoding_set.trim().is_empty() {
            return Err(Error::Config("DEFAULT_DECODING_SET is empty".to_string()));
        }
        if !(self.neurovault_api_url.starts_with("http://")
            || self.neurovault_api_url.starts_with("https://"))
        {
            return Err(Error::Config(format!(
                "NEUROVAULT_API_URL is not an http(s) URL: {}",
                self.neurovault_api_url
            )));
        }
        Ok(())
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url == MEMORY_DATABASE_URL
    }

    pub fn with_cache_decodings(mut self, enabled: bool) -> Self {
        self.cache_decodings = enabled;
        self
    }

    pub fn with_neurovault_api_url(mut self, url: impl Into<String>) -> Self {
        self.neurovault_api_url = url.into();
        self
    }

    /// Point every artifact and data directory below `root`.
    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.decoded_image_dir = root.join("decoded");
        self.results_dir = root.join("results");
        self.scatterplots_dir = root.join("scatterplots");
        self.image_dir = root.join("images");
        self.reference_data_dir = root.join("reference");
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.cache_decodings);
        assert_eq!(config.max_image_bytes, 4_000_000);
        assert_eq!(config.default_decoding_set, "terms_20k");
        assert_eq!(config.task_timeout, Duration::from_secs(300));
        assert!(!config.uses_memory_store());
    }

    #[test]
    fn test_data_root_builder() {
        let config = AppConfig::default()
            .with_data_root("/tmp/ns")
            .with_cache_decodings(false);
        assert_eq!(config.results_dir, PathBuf::from("/tmp/ns/results"));
        assert_eq!(config.reference_data_dir, PathBuf::from("/tmp/ns/reference"));
        assert!(!config.cache_decodings);
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        assert!(AppConfig::default().validate().is_ok());

        let zero_cap = AppConfig {
            max_image_bytes: 0,
            ..AppConfig::default()
        };
        assert!(matches!(zero_cap.validate(), Err(Error::Config(_))));

        let no_wait = AppConfig::default().with_task_timeout(Duration::ZERO);
        assert!(matches!(no_wait.validate(), Err(Error::Config(_))));

        let bad_url = AppConfig::default().with_neurovault_api_url("neurovault.org/api");
        assert!(matches!(bad_url.validate(), Err(Error::Config(_))));
    }
}
