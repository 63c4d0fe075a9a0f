//! Helpers that turn raw request input into canonical identities and names.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};

static SCHEME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://").expect("valid regex"));

static NIFTI_EXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.nii(\.gz)?$").expect("valid regex"));

static DECODING_UUID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{32}$").expect("valid regex"));

static ANALYSIS_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _.,()'+-]{0,254}$").expect("valid regex"));

/// Prefix `http://` when the URL carries no http(s) scheme.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if SCHEME_RE.is_match(url) {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// Return the NIfTI extension (`.nii` or `.nii.gz`) of a URL or path.
pub fn nifti_extension(url: &str) -> Option<&str> {
    NIFTI_EXT_RE.find(url).map(|m| m.as_str())
}

/// Last path segment of a URL or filesystem path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// New public decoding identifier (UUIDv4 as 32 lowercase hex characters).
pub fn new_decoding_uuid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Reject anything that is not a 32-character lowercase hex decoding id.
pub fn validate_decoding_uuid(uuid: &str) -> Result<()> {
    if !DECODING_UUID_RE.is_match(uuid) {
        return Err(Error::Validation(format!("Invalid decoding id: {:?}", uuid)));
    }
    Ok(())
}

/// Resolve the `set` request parameter to a reference set name.
///
/// Missing values use the configured default; `terms` and `topics` expand to
/// their reduced `_20k` sets.
pub fn resolve_set_name(requested: Option<&str>, default_set: &str) -> String {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        None => default_set.to_string(),
        Some(name @ ("terms" | "topics")) => {
            format!("{}{}", name, defaults::DECODING_SET_SHORTHAND_SUFFIX)
        }
        Some(name) => name.to_string(),
    }
}

/// Reject analysis names that could escape the scatterplot directory.
pub fn validate_analysis_name(analysis: &str) -> Result<()> {
    if analysis.contains("..") || !ANALYSIS_NAME_RE.is_match(analysis) {
        return Err(Error::Validation(format!(
            "Invalid analysis name: {:?}",
            analysis
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url_adds_scheme() {
        assert_eq!(
            normalize_url("example.org/img.nii.gz"),
            "http://example.org/img.nii.gz"
        );
        assert_eq!(
            normalize_url("https://example.org/img.nii"),
            "https://example.org/img.nii"
        );
        assert_eq!(
            normalize_url("  http://example.org/a.nii  "),
            "http://example.org/a.nii"
        );
    }

    #[test]
    fn test_nifti_extension() {
        assert_eq!(nifti_extension("http://a.org/x.nii"), Some(".nii"));
        assert_eq!(nifti_extension("http://a.org/x.nii.gz"), Some(".nii.gz"));
        assert_eq!(nifti_extension("http://a.org/x.img"), None);
        assert_eq!(nifti_extension("http://a.org/x.nii.gz?dl=1"), None);
        assert_eq!(nifti_extension("http://a.org/x.gz"), None);
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("http://a.org/dir/map.nii.gz"), "map.nii.gz");
        assert_eq!(basename("map.nii"), "map.nii");
    }

    #[test]
    fn test_new_decoding_uuid_format() {
        let id = new_decoding_uuid();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, new_decoding_uuid());
    }

    #[test]
    fn test_resolve_set_name() {
        assert_eq!(resolve_set_name(None, "terms_20k"), "terms_20k");
        assert_eq!(resolve_set_name(Some(""), "terms_20k"), "terms_20k");
        assert_eq!(resolve_set_name(Some("terms"), "terms_20k"), "terms_20k");
        assert_eq!(resolve_set_name(Some("topics"), "terms_20k"), "topics_20k");
        assert_eq!(resolve_set_name(Some("terms_full"), "terms_20k"), "terms_full");
    }

    #[test]
    fn test_validate_analysis_name() {
        assert!(validate_analysis_name("working memory").is_ok());
        assert!(validate_analysis_name("topic_042").is_ok());
        assert!(validate_analysis_name("../etc/passwd").is_err());
        assert!(validate_analysis_name("a/b").is_err());
        assert!(validate_analysis_name("").is_err());
        assert!(validate_analysis_name("..").is_err());
    }

    #[test]
    fn test_validate_decoding_uuid() {
        assert!(validate_decoding_uuid(&new_decoding_uuid()).is_ok());
        assert!(validate_decoding_uuid("../secret").is_err());
        assert!(validate_decoding_uuid(&"A".repeat(32)).is_err());
        assert!(validate_decoding_uuid(&"a".repeat(31)).is_err());
        assert!(validate_decoding_uuid("").is_err());
    }
}
