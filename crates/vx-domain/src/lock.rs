use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::canon::canonical_json_bytes;
use crate::spec::{atomic_write, SpecOptions};

pub const LOCK_EXTENSION: &str = "lock";

/// A git source with its ref pinned to a concrete commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedSource {
    pub repo: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    pub commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A model entry with `name` and `target_path` fully materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedModel {
    pub source: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_subdir: Option<String>,
    pub target_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// The resolver's output: a spec with every ref replaced by a commit.
///
/// Locks are overwritten by newer resolutions; `resolved_at` increases
/// monotonically so readers can order them, and `spec_digest` ties a lock
/// back to the exact spec bytes that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLock {
    pub schema_version: u32,
    pub version_id: String,
    pub engine_source: LockedSource,
    #[serde(default)]
    pub extensions: Vec<LockedSource>,
    #[serde(default)]
    pub models: Vec<LockedModel>,
    #[serde(default)]
    pub extra_packages: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub options: SpecOptions,
    pub resolved_at: i64,
    pub spec_digest: String,
}

impl ResolvedLock {
    /// Canonical bytes of this lock. Identical inputs yield identical bytes.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization fails.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical_json_bytes(self)
    }
}

/// Lock location: `$CACHE_ROOT/resolved/<version_id>.lock`.
#[must_use]
pub fn lock_path(cache_root: &Path, version_id: &str) -> PathBuf {
    cache_root
        .join("resolved")
        .join(format!("{version_id}.{LOCK_EXTENSION}"))
}

/// Atomically persist a lock. Readers observe either the previous file or the
/// new one, never a partial write.
///
/// # Errors
///
/// Returns an error when serialization or the replace fails.
pub fn write_lock(path: &Path, lock: &ResolvedLock) -> Result<()> {
    let bytes = lock.canonical_bytes()?;
    atomic_write(path, &bytes)
}

/// Load a lock if present.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be read or parsed.
pub fn load_lock(path: &Path) -> Result<Option<ResolvedLock>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read lock {}", path.display()))
        }
    };
    let lock: ResolvedLock = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse lock {}", path.display()))?;
    Ok(Some(lock))
}
