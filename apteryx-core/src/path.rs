//! Path parsing and validation.
//!
//! A path is `/seg1/seg2/...`; segments are non-empty and may contain any
//! byte except `/`. Patterns additionally permit `*` as a whole segment and
//! a trailing empty segment (from a trailing `/`) meaning "one level below".

use crate::errors::StoreError;

/// The wildcard segment.
pub const WILDCARD: &str = "*";

/// Validate a concrete datastore path (no wildcards, no trailing slash).
pub fn validate(path: &str) -> Result<(), StoreError> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    if path[1..].split('/').any(|seg| seg.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Validate a search prefix: absolute and ending in `/` (the root `/` is a
/// valid prefix).
pub fn validate_prefix(prefix: &str) -> Result<(), StoreError> {
    if !prefix.starts_with('/') || !prefix.ends_with('/') {
        return Err(StoreError::InvalidPath(prefix.to_string()));
    }
    if prefix.len() == 1 {
        return Ok(());
    }
    let inner = &prefix[1..prefix.len() - 1];
    if !inner.is_empty() && inner.split('/').any(|seg| seg.is_empty()) {
        return Err(StoreError::InvalidPath(prefix.to_string()));
    }
    Ok(())
}

/// Split a concrete path into segments. The root `/` yields no segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|seg| !seg.is_empty()).collect()
}

/// Split a pattern into segments, keeping a trailing empty segment as the
/// one-level marker: `/a/b/` becomes `["a", "b", ""]`.
pub fn pattern_segments(pattern: &str) -> Vec<&str> {
    let trimmed = pattern.strip_prefix('/').unwrap_or(pattern);
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('/').collect()
}

/// Validate a registration pattern: absolute, and only the final segment
/// may be empty (a trailing `/`) or a `*`; interior `*` segments are fine.
pub fn validate_pattern(pattern: &str) -> Result<(), StoreError> {
    if !pattern.starts_with('/') || pattern.len() < 2 {
        return Err(StoreError::InvalidPath(pattern.to_string()));
    }
    let segs = pattern_segments(pattern);
    if segs[..segs.len() - 1].iter().any(|seg| seg.is_empty()) {
        return Err(StoreError::InvalidPath(pattern.to_string()));
    }
    Ok(())
}

/// The parent of a path, or `/` at the top.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// The last segment of a path.
pub fn leaf(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// True when `path` equals `prefix` or lives below it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    path == prefix
        || (path.len() > prefix.len() && path.starts_with(prefix) && path.as_bytes()[prefix.len()] == b'/')
}

/// Longest common path prefix of a set of paths (segment-aligned).
/// Returns `/` when nothing is shared.
pub fn common_prefix<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    let mut iter = paths.into_iter();
    let Some(first) = iter.next() else {
        return "/".to_string();
    };
    let mut common: Vec<&str> = segments(first);
    for path in iter {
        let segs = segments(path);
        let shared = common
            .iter()
            .zip(segs.iter())
            .take_while(|(a, b)| a == b)
            .count();
        common.truncate(shared);
        if common.is_empty() {
            return "/".to_string();
        }
    }
    let mut out = String::new();
    for seg in common {
        out.push('/');
        out.push_str(seg);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
