//! Name and key validation
//!
//! Names are what humans type; keys are what drivers turn into file names
//! and command environments. Both are checked before anything touches disk
//! or spawns a process.

use anyhow::{bail, Result};
use regex::Regex;
use std::sync::OnceLock;

use crate::error::SecretsError;

/// Longest accepted secret name
pub const MAX_NAME_LENGTH: usize = 253;

/// Longest accepted driver key (a single path component on most filesystems)
pub const MAX_KEY_LENGTH: usize = 255;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9.@_-]+$").expect("valid name pattern"))
}

/// Validate a secret name
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| SecretsError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        bail!(invalid("name cannot be empty"));
    }

    if name.len() > MAX_NAME_LENGTH {
        bail!(invalid(&format!(
            "name must be at most {} characters",
            MAX_NAME_LENGTH
        )));
    }

    if !name_pattern().is_match(name) {
        bail!(invalid(
            "only letters, digits and the characters . @ _ - are allowed"
        ));
    }

    Ok(())
}

/// Validate a key before a driver interpolates it into a path or command.
///
/// Keys live in one flat namespace: no separators, no parent references,
/// nothing that could name a location outside the driver's root.
pub fn validate_key(key: &str) -> Result<()> {
    let invalid = |reason: &str| SecretsError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.is_empty() {
        bail!(invalid("key cannot be empty"));
    }

    if key.len() > MAX_KEY_LENGTH {
        bail!(invalid(&format!(
            "key must be at most {} characters",
            MAX_KEY_LENGTH
        )));
    }

    if key.starts_with('/') || key.contains('/') || key.contains('\\') {
        bail!(invalid("path separators are not allowed"));
    }

    if key.contains("..") || key == "." {
        bail!(invalid("parent or current directory references are not allowed"));
    }

    if key.chars().any(|c| c.is_control()) {
        bail!(invalid("control characters are not allowed"));
    }

    Ok(())
}
