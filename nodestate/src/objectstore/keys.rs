//! Object key rules.

use crate::errors::{NodeStateError, Result, ValidationError};

/// Longest key S3 accepts, in bytes.
pub const MAX_KEY_BYTES: usize = 1024;

/// Rejects keys that are blank or longer than [`MAX_KEY_BYTES`].
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(ValidationError::new("object key must not be empty or whitespace")
            .with_field("key")
            .into());
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(ValidationError::new(format!(
            "object key is {} bytes, longer than the {MAX_KEY_BYTES} byte limit",
            key.len()
        ))
        .with_field("key")
        .into());
    }
    Ok(())
}

/// Joins a key prefix and a relative path with single slashes.
#[must_use]
pub fn join_key(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    match (prefix.is_empty(), relative.is_empty()) {
        (true, _) => relative.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}/{relative}"),
    }
}

/// Directory form of a prefix: trailing slash, no leading slash.
#[must_use]
pub fn directory_prefix(prefix: &str) -> String {
    let cleaned = prefix.trim_matches('/');
    if cleaned.is_empty() {
        String::new()
    } else {
        format!("{cleaned}/")
    }
}

/// Strips `prefix` from `key`, returning the path relative to it.
pub fn relative_key<'a>(prefix: &str, key: &'a str) -> Result<&'a str> {
    let dir = directory_prefix(prefix);
    key.strip_prefix(dir.as_str())
        .filter(|rel| !rel.is_empty())
        .ok_or_else(|| NodeStateError::validation(format!("key '{key}' is not under '{dir}'")))
}
