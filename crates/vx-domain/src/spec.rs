use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canon::canonical_json_bytes;
use crate::checksum::Checksum;
use crate::paths::safe_relative;

/// Current spec schema generation. Specs carrying any other value are refused.
pub const SCHEMA_VERSION: u32 = 2;

/// Validation failures for a [`VersionSpec`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("unsupported schema_version {found} (expected {SCHEMA_VERSION})")]
    SchemaVersion { found: u32 },
    #[error("version_id '{0}' must match [A-Za-z0-9._-]+")]
    InvalidVersionId(String),
    #[error("{section}: repo must not be empty")]
    EmptyRepo { section: String },
    #[error("{section}: either 'ref' or 'commit' is required")]
    MissingRef { section: String },
    #[error("{section}: invalid commit '{commit}' (full hex sha expected)")]
    InvalidCommit { section: String, commit: String },
    #[error("models[{index}]: source must not be empty")]
    EmptyModelSource { index: usize },
    #[error("models[{index}]: either 'target_subdir' or 'target_path' is required")]
    MissingModelTarget { index: usize },
    #[error("models[{index}]: {message}")]
    UnsafeModelPath { index: usize, message: String },
    #[error("models[{index}]: {message}")]
    InvalidChecksum { index: usize, message: String },
}

/// A git source: the engine core or one extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub repo: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One model artifact to fetch and project into the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_subdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ModelEntry {
    /// Artifact file name: the declared `name`, else the URI tail.
    #[must_use]
    pub fn effective_name(&self) -> String {
        if let Some(name) = self.name.as_deref() {
            let trimmed = name.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        derive_model_name(&self.source)
    }
}

/// Take the last path segment of a source URI, ignoring query strings.
#[must_use]
pub(crate) fn derive_model_name(source: &str) -> String {
    let without_query = source.split(['?', '#']).next().unwrap_or(source);
    let tail = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .trim();
    if tail.is_empty() {
        "model".to_string()
    } else {
        tail.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecOptions {
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub skip_models: bool,
}

/// A user-authored version specification, schema v2.
///
/// Specs are frozen once written: the system never mutates a spec file, and
/// edits are expected to produce a new file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSpec {
    pub schema_version: u32,
    pub version_id: String,
    pub engine_source: SourceEntry,
    #[serde(default)]
    pub extensions: Vec<SourceEntry>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub extra_packages: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub options: SpecOptions,
}

impl VersionSpec {
    /// Structural validation: schema generation, identifier shape, source
    /// pinning requirements, model targets, and path safety.
    ///
    /// # Errors
    ///
    /// Returns the first [`SpecError`] encountered, in field order.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(SpecError::SchemaVersion {
                found: self.schema_version,
            });
        }
        if !is_valid_version_id(&self.version_id) {
            return Err(SpecError::InvalidVersionId(self.version_id.clone()));
        }
        validate_source(&self.engine_source, "engine_source")?;
        for (index, extension) in self.extensions.iter().enumerate() {
            validate_source(extension, &format!("extensions[{index}]"))?;
        }
        for (index, model) in self.models.iter().enumerate() {
            validate_model(model, index)?;
        }
        Ok(())
    }
}

fn validate_source(source: &SourceEntry, section: &str) -> Result<(), SpecError> {
    if source.repo.trim().is_empty() {
        return Err(SpecError::EmptyRepo {
            section: section.to_string(),
        });
    }
    match (&source.git_ref, &source.commit) {
        (None, None) => Err(SpecError::MissingRef {
            section: section.to_string(),
        }),
        (_, Some(commit)) if !looks_like_commit(commit) => Err(SpecError::InvalidCommit {
            section: section.to_string(),
            commit: commit.clone(),
        }),
        _ => Ok(()),
    }
}

fn validate_model(model: &ModelEntry, index: usize) -> Result<(), SpecError> {
    if model.source.trim().is_empty() {
        return Err(SpecError::EmptyModelSource { index });
    }
    if model.target_subdir.is_none() && model.target_path.is_none() {
        return Err(SpecError::MissingModelTarget { index });
    }
    for candidate in [
        model.target_subdir.as_deref(),
        model.target_path.as_deref(),
        model.name.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        safe_relative(candidate).map_err(|err| SpecError::UnsafeModelPath {
            index,
            message: err.to_string(),
        })?;
    }
    if let Some(raw) = model.checksum.as_deref() {
        Checksum::parse(raw).map_err(|message| SpecError::InvalidChecksum { index, message })?;
    }
    Ok(())
}

#[must_use]
pub(crate) fn is_valid_version_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Whether a ref value is already a pinned full commit hash (40 or 64 hex).
#[must_use]
pub fn looks_like_commit(value: &str) -> bool {
    let value = value.trim();
    let len = value.len();
    (len == 40 || len == 64) && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Lowercase a commit hash, refusing values that are not full hex shas.
///
/// # Errors
///
/// Returns the offending value.
pub fn normalize_commit(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if looks_like_commit(trimmed) {
        Ok(trimmed.to_ascii_lowercase())
    } else {
        Err(trimmed.to_string())
    }
}

/// Spec file location: `<specs_root>/versions/<id>.json`.
#[must_use]
pub fn spec_path_for(specs_root: &Path, version_id: &str) -> PathBuf {
    specs_root.join("versions").join(format!("{version_id}.json"))
}

/// Hex SHA-256 of the spec's canonical bytes. Recorded in the lock so stale
/// locks can be told apart from the spec that produced them.
///
/// # Errors
///
/// Returns an error when the spec cannot be serialized.
pub fn spec_digest(spec: &VersionSpec) -> Result<String> {
    let bytes = canonical_json_bytes(spec)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Load and validate a spec file.
///
/// # Errors
///
/// Returns an error when the file is missing, malformed, or fails validation.
pub fn load_spec(path: &Path) -> Result<VersionSpec> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read spec {}", path.display()))?;
    let spec: VersionSpec = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse spec {}", path.display()))?;
    spec.validate()
        .with_context(|| format!("invalid spec {}", path.display()))?;
    Ok(spec)
}

/// Write a spec atomically in canonical form.
///
/// # Errors
///
/// Returns an error when serialization or the atomic replace fails.
pub fn write_spec(path: &Path, spec: &VersionSpec) -> Result<()> {
    let bytes = canonical_json_bytes(spec)?;
    atomic_write(path, &bytes)
}

pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
