use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use vx_domain::Checksum;

use crate::config::Config;
use crate::fsx::{replace_link, sha256_hex};

/// Key addressing a model blob in the shared cache.
///
/// A declared checksum keys by content; sources without one fall back to the
/// SHA-256 of the canonicalized URI. URI keys live under their own `uri/`
/// namespace so they can never collide with a genuine content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey {
    pub algo: String,
    pub hex: String,
}

impl BlobKey {
    #[must_use]
    pub fn from_checksum(checksum: &Checksum) -> Self {
        Self {
            algo: checksum.algo.as_str().to_string(),
            hex: checksum.hex.clone(),
        }
    }

    #[must_use]
    pub fn from_uri(uri: &str) -> Self {
        Self {
            algo: "uri".to_string(),
            hex: sha256_hex(uri.trim().as_bytes()),
        }
    }
}

/// The content-addressed store: two namespaces (`sources/`, `models/`) with
/// immutable, atomically published entries, plus symlink projection into
/// per-version workspaces.
pub struct Store<'a> {
    config: &'a Config,
}

impl<'a> Store<'a> {
    #[must_use]
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Directory owning a model blob: `models/<algo>/<hh>/<hex>/`.
    #[must_use]
    pub fn blob_dir(&self, key: &BlobKey) -> PathBuf {
        let shard = key.hex.get(0..2).unwrap_or("xx");
        self.config
            .models_cache_dir()
            .join(&key.algo)
            .join(shard)
            .join(&key.hex)
    }

    /// The blob file itself. Present iff the entry is fully published.
    #[must_use]
    pub fn blob_path(&self, key: &BlobKey) -> PathBuf {
        self.blob_dir(key).join("blob")
    }

    /// Project a source cache entry (a directory) into the workspace.
    ///
    /// # Errors
    ///
    /// Refuses a pre-existing non-symlink target unless `overwrite` is set.
    pub fn project_source(&self, entry: &Path, target: &Path, overwrite: bool) -> Result<()> {
        replace_link(entry, target, overwrite)
            .with_context(|| format!("failed to project source into {}", target.display()))?;
        debug!(target = %target.display(), entry = %entry.display(), "projected source");
        Ok(())
    }

    /// Project a model blob (a file) into the workspace, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Refuses a pre-existing non-symlink target unless `overwrite` is set.
    pub fn project_model(&self, blob: &Path, target: &Path, overwrite: bool) -> Result<()> {
        replace_link(blob, target, overwrite)
            .with_context(|| format!("failed to project model into {}", target.display()))?;
        debug!(target = %target.display(), blob = %blob.display(), "projected model");
        Ok(())
    }
}
