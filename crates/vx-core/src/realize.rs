//! The realizer: turns a resolved lock into a ready workspace.
//!
//! Phases run in a fixed order: sources, models, environment, marker. A
//! marker that matches the current lock digest short-circuits the whole run,
//! which is what keeps warm-start realization under the serverless budget.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vx_domain::{Checksum, ResolvedLock};

use crate::config::Config;
use crate::envbuild::{build_env, venv_python};
use crate::errors::{classify, core_error, CoreError, ErrorKind};
use crate::fetch::Fetcher;
use crate::fsx::sha256_hex;
use crate::git::GitResolver;
use crate::store::Store;

pub const MARKER_FILE: &str = ".env_marker";

/// Workspace marker recording which lock produced the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub version_id: String,
    pub lock_digest: String,
}

/// Caller knobs for one realization.
#[derive(Debug, Clone, Default)]
pub struct RealizeOptions {
    pub target: Option<PathBuf>,
    pub models_dir: Option<PathBuf>,
    pub wheels_dir: Option<PathBuf>,
    pub overwrite: bool,
}

/// What a completed realization hands back.
#[derive(Debug, Clone)]
pub struct Realized {
    pub workspace: PathBuf,
    pub models_dir: PathBuf,
    /// True when the marker matched and phases 2-4 were skipped entirely.
    pub short_circuited: bool,
    /// Non-fatal problems (offline model fetches). Non-empty warnings
    /// suppress the marker so the next online run completes the workspace.
    pub warnings: Vec<String>,
}

/// Digest identifying the exact lock content, stored in the marker.
///
/// # Errors
///
/// Returns an error when the lock cannot be serialized.
pub fn lock_digest(lock: &ResolvedLock) -> Result<String> {
    Ok(sha256_hex(&lock.canonical_bytes()?))
}

/// Realize a lock into its workspace.
///
/// # Errors
///
/// Source and environment failures are fatal (the marker is left unwritten);
/// model failures are fatal online and downgraded to warnings offline.
pub fn realize(config: &Config, lock: &ResolvedLock, opts: &RealizeOptions) -> Result<Realized> {
    let workspace = workspace_path(config, lock, opts);
    let models_dir = models_dir_path(config, &workspace, opts);
    let digest = lock_digest(lock)?;
    let offline = config.offline || lock.options.offline;

    if workspace_is_current(&workspace, &models_dir, lock, &digest) {
        debug!(workspace = %workspace.display(), "workspace marker matches lock; realization is a no-op");
        return Ok(Realized {
            workspace,
            models_dir,
            short_circuited: true,
            warnings: Vec::new(),
        });
    }

    fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;

    // The workspace (its .venv especially) is single-writer; a file lock
    // serializes realization across worker processes sharing it.
    let _guard = acquire_workspace_lock(&workspace)?;
    if workspace_is_current(&workspace, &models_dir, lock, &digest) {
        debug!(workspace = %workspace.display(), "another process realized the workspace while we waited");
        return Ok(Realized {
            workspace,
            models_dir,
            short_circuited: true,
            warnings: Vec::new(),
        });
    }

    realize_sources(config, lock, &workspace, opts.overwrite)
        .map_err(|err| ensure_kind(err, ErrorKind::Realization))?;

    let warnings = realize_models(config, lock, &models_dir, offline, opts.overwrite)?;

    build_env(
        &workspace,
        &models_dir,
        lock,
        opts.wheels_dir.as_deref(),
        offline,
    )
    .map_err(|err| ensure_kind(err, ErrorKind::EnvBuild))?;

    if warnings.is_empty() {
        write_marker(&workspace, lock, &digest)?;
        info!(workspace = %workspace.display(), "workspace realized");
    } else {
        warn!(
            workspace = %workspace.display(),
            warnings = warnings.len(),
            "workspace realized partially; marker withheld"
        );
    }

    Ok(Realized {
        workspace,
        models_dir,
        short_circuited: false,
        warnings,
    })
}

/// Human-readable plan of what a realization would do, for `--dry-run` and
/// `validate` output.
#[must_use]
pub fn plan_lines(
    config: &Config,
    lock: &ResolvedLock,
    opts: &RealizeOptions,
) -> Vec<String> {
    let workspace = workspace_path(config, lock, opts);
    let models_dir = models_dir_path(config, &workspace, opts);
    let offline = config.offline || lock.options.offline;
    let store = Store::new(config);

    let mut lines = vec![
        format!("  version_id:  {}", lock.version_id),
        format!("  target:      {}", workspace.display()),
        format!("  models_dir:  {}", models_dir.display()),
        format!("  offline:     {offline}"),
        format!(
            "  engine:      {} @ {}",
            lock.engine_source.repo, lock.engine_source.commit
        ),
    ];
    if let Some(wheels) = &opts.wheels_dir {
        lines.push(format!("  wheels_dir:  {}", wheels.display()));
    }
    if !lock.extensions.is_empty() {
        lines.push("  extensions:".to_string());
        for extension in &lock.extensions {
            lines.push(format!(
                "    - {} (commit: {})",
                extension.name.as_deref().unwrap_or(&extension.repo),
                extension.commit
            ));
        }
    }
    if !lock.models.is_empty() {
        lines.push("  models:".to_string());
        for model in &lock.models {
            let cached = model_blob_key(model)
                .map(|key| store.blob_path(&key).is_file())
                .unwrap_or(false);
            let state = if cached { "cached" } else { "fetch" };
            lines.push(format!("    - {} -> {} [{state}]", model.name, model.target_path));
        }
    }
    lines
}

fn workspace_path(config: &Config, lock: &ResolvedLock, opts: &RealizeOptions) -> PathBuf {
    opts.target
        .clone()
        .unwrap_or_else(|| config.workspace_for(&lock.version_id))
}

fn models_dir_path(config: &Config, workspace: &Path, opts: &RealizeOptions) -> PathBuf {
    opts.models_dir
        .clone()
        .unwrap_or_else(|| config.models_dir_for(workspace))
}

/// Marker matches and every projection is healthy.
fn workspace_is_current(
    workspace: &Path,
    models_dir: &Path,
    lock: &ResolvedLock,
    digest: &str,
) -> bool {
    match read_marker(workspace) {
        Some(marker) => {
            if marker.version_id != lock.version_id || marker.lock_digest != digest {
                return false;
            }
        }
        None => return false,
    }
    if !link_resolves(&workspace.join("engine")) {
        return false;
    }
    for extension in &lock.extensions {
        let name = extension.name.as_deref().unwrap_or("extension");
        if !link_resolves(&workspace.join("custom_nodes").join(name)) {
            return false;
        }
    }
    if !lock.options.skip_models {
        for model in &lock.models {
            if !link_resolves(&models_dir.join(&model.target_path)) {
                return false;
            }
        }
    }
    venv_python(workspace).is_file()
}

fn link_resolves(path: &Path) -> bool {
    // Symlink exists and its target does too.
    fs::symlink_metadata(path).is_ok() && fs::metadata(path).is_ok()
}

fn realize_sources(
    config: &Config,
    lock: &ResolvedLock,
    workspace: &Path,
    overwrite: bool,
) -> Result<()> {
    let git = GitResolver::new(config);
    let store = Store::new(config);

    let engine_entry = git.materialize(&lock.engine_source.repo, &lock.engine_source.commit)?;
    store.project_source(&engine_entry, &workspace.join("engine"), overwrite)?;

    for extension in &lock.extensions {
        let name = extension.name.as_deref().unwrap_or("extension");
        let entry = git.materialize(&extension.repo, &extension.commit)?;
        store.project_source(
            &entry,
            &workspace.join("custom_nodes").join(name),
            overwrite,
        )?;
    }
    Ok(())
}

fn realize_models(
    config: &Config,
    lock: &ResolvedLock,
    models_dir: &Path,
    offline: bool,
    overwrite: bool,
) -> Result<Vec<String>> {
    if lock.options.skip_models {
        warn!("skip_models set; leaving model projections untouched");
        return Ok(Vec::new());
    }
    let fetcher = Fetcher::new(config);
    let store = Store::new(config);
    let mut warnings = Vec::new();

    for model in &lock.models {
        let checksum = parse_model_checksum(model)?;
        let outcome = fetcher
            .fetch(&model.source, checksum.as_ref())
            .and_then(|blob| {
                store.project_model(&blob, &models_dir.join(&model.target_path), overwrite)
            });
        match outcome {
            Ok(()) => {}
            Err(err) if offline && classify(&err) == ErrorKind::OfflineUnavailable => {
                let message = format!("model '{}' unavailable offline: {err:#}", model.name);
                warn!("{message}");
                warnings.push(message);
            }
            Err(err) => {
                return Err(err.context(format!("failed to realize model '{}'", model.name)))
            }
        }
    }
    Ok(warnings)
}

fn parse_model_checksum(model: &vx_domain::LockedModel) -> Result<Option<Checksum>> {
    model
        .checksum
        .as_deref()
        .map(|raw| {
            Checksum::parse(raw).map_err(|message| {
                core_error(
                    ErrorKind::Validation,
                    format!("model '{}': {message}", model.name),
                )
            })
        })
        .transpose()
}

fn model_blob_key(model: &vx_domain::LockedModel) -> Option<crate::store::BlobKey> {
    match model.checksum.as_deref() {
        Some(raw) => Checksum::parse(raw)
            .ok()
            .map(|sum| crate::store::BlobKey::from_checksum(&sum)),
        None => Some(crate::store::BlobKey::from_uri(&model.source)),
    }
}

fn write_marker(workspace: &Path, lock: &ResolvedLock, digest: &str) -> Result<()> {
    let marker = Marker {
        version_id: lock.version_id.clone(),
        lock_digest: digest.to_string(),
    };
    let bytes = serde_json::to_vec_pretty(&marker).context("failed to encode marker")?;
    let path = workspace.join(MARKER_FILE);
    atomic_write_bytes(&path, &bytes)
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write as _;
    let parent = path.parent().context("marker path has no parent")?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp marker in {}", parent.display()))?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn acquire_workspace_lock(workspace: &Path) -> Result<File> {
    let path = workspace.join(".realize.lock");
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .with_context(|| format!("failed to open workspace lock {}", path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("failed to lock {}", path.display()))?;
    Ok(file)
}

/// Read a workspace marker if present and parseable.
#[must_use]
pub fn read_marker(workspace: &Path) -> Option<Marker> {
    let contents = fs::read_to_string(workspace.join(MARKER_FILE)).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Wrap an error with `fallback` only when nothing more specific is attached.
fn ensure_kind(err: anyhow::Error, fallback: ErrorKind) -> anyhow::Error {
    if classify(&err) == ErrorKind::Internal {
        anyhow::Error::from(CoreError::new(fallback, format!("{err:#}")))
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvSnapshot;
    use std::collections::BTreeMap;
    use vx_domain::{LockedModel, LockedSource, SpecOptions};

    fn config(cache_root: &Path, offline: bool) -> Config {
        let root = cache_root.to_str().expect("utf8").to_string();
        let mut pairs = vec![("CACHE_ROOT", root.as_str())];
        if offline {
            pairs.push(("OFFLINE", "1"));
        }
        Config::from_snapshot(&EnvSnapshot::testing(&pairs))
    }

    fn lock_with_models(models: Vec<LockedModel>) -> ResolvedLock {
        ResolvedLock {
            schema_version: 2,
            version_id: "t1".to_string(),
            engine_source: LockedSource {
                repo: "https://git.example/engine/engine.git".to_string(),
                git_ref: None,
                commit: "a".repeat(40),
                name: None,
            },
            extensions: Vec::new(),
            models,
            extra_packages: Vec::new(),
            env: BTreeMap::new(),
            options: SpecOptions::default(),
            resolved_at: 1,
            spec_digest: "0".repeat(64),
        }
    }

    #[test]
    fn marker_round_trip_and_short_circuit_detection() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = temp.path().join("ws");
        fs::create_dir_all(&workspace).expect("ws");
        let lock = lock_with_models(Vec::new());
        let digest = lock_digest(&lock).expect("digest");

        assert!(read_marker(&workspace).is_none());
        write_marker(&workspace, &lock, &digest).expect("marker");
        let marker = read_marker(&workspace).expect("read");
        assert_eq!(marker.version_id, "t1");
        assert_eq!(marker.lock_digest, digest);

        // Marker alone is not enough: the engine projection must resolve.
        assert!(!workspace_is_current(
            &workspace,
            &workspace.join("models"),
            &lock,
            &digest
        ));
    }

    #[test]
    fn warm_workspace_short_circuits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cache = temp.path().join("cache");
        let cfg = config(&cache, false);
        let lock = lock_with_models(Vec::new());
        let workspace = temp.path().join("ws");

        // Hand-build a healthy workspace: engine symlink, venv, marker.
        let entry = cache.join("sources/engine@aaaa");
        fs::create_dir_all(&entry).expect("entry");
        crate::fsx::replace_link(&entry, &workspace.join("engine"), false).expect("link");
        fs::create_dir_all(workspace.join(".venv/bin")).expect("venv");
        fs::write(workspace.join(".venv/bin/python"), b"#!stub").expect("python");
        let digest = lock_digest(&lock).expect("digest");
        write_marker(&workspace, &lock, &digest).expect("marker");

        let realized = realize(
            &cfg,
            &lock,
            &RealizeOptions {
                target: Some(workspace.clone()),
                ..RealizeOptions::default()
            },
        )
        .expect("realize");
        assert!(realized.short_circuited);
        assert_eq!(realized.workspace, workspace);
    }

    #[test]
    fn stale_digest_defeats_short_circuit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = temp.path().join("ws");
        fs::create_dir_all(&workspace).expect("ws");
        let lock = lock_with_models(Vec::new());
        write_marker(&workspace, &lock, &"e".repeat(64)).expect("marker");
        assert!(!workspace_is_current(
            &workspace,
            &workspace.join("models"),
            &lock,
            &lock_digest(&lock).expect("digest")
        ));
    }

    #[test]
    fn offline_missing_model_is_a_warning_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(&temp.path().join("cache"), true);
        let lock = lock_with_models(vec![LockedModel {
            source: "https://host.example/absent.bin".to_string(),
            name: "absent.bin".to_string(),
            target_subdir: None,
            target_path: "checkpoints/absent.bin".to_string(),
            checksum: None,
        }]);
        let warnings = realize_models(
            &cfg,
            &lock,
            &temp.path().join("models"),
            true,
            false,
        )
        .expect("best effort");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("absent.bin"));
    }

    #[test]
    fn skip_models_skips_everything() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(&temp.path().join("cache"), false);
        let mut lock = lock_with_models(vec![LockedModel {
            source: "https://host.example/never-fetched.bin".to_string(),
            name: "never-fetched.bin".to_string(),
            target_subdir: None,
            target_path: "checkpoints/never-fetched.bin".to_string(),
            checksum: None,
        }]);
        lock.options.skip_models = true;
        let warnings =
            realize_models(&cfg, &lock, &temp.path().join("models"), false, false)
                .expect("skipped");
        assert!(warnings.is_empty());
    }

    #[test]
    fn plan_lines_mention_models_and_cache_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(&temp.path().join("cache"), false);
        let lock = lock_with_models(vec![LockedModel {
            source: "https://host.example/m.bin".to_string(),
            name: "m.bin".to_string(),
            target_subdir: None,
            target_path: "checkpoints/m.bin".to_string(),
            checksum: None,
        }]);
        let lines = plan_lines(&cfg, &lock, &RealizeOptions::default());
        let rendered = lines.join("\n");
        assert!(rendered.contains("version_id:  t1"));
        assert!(rendered.contains("m.bin -> checkpoints/m.bin [fetch]"));
    }
}
