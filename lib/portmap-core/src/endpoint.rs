//! Endpoint path normalization
//!
//! Stored endpoints and incoming request paths are both canonicalized
//! through [`normalize_endpoint`] so that `/foo`, `/foo/`, and `//foo`
//! compare as the same mapping key.

/// Canonicalize a path: leading slash, single slashes, no trailing slash.
///
/// Total and idempotent; blank input maps to `/`.
pub fn normalize_endpoint(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return "/".to_string();
    }

    let mut normalized = String::with_capacity(trimmed.len() + 1);
    for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }

    if normalized.is_empty() {
        "/".to_string()
    } else {
        normalized
    }
}
