use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info};

use vx_domain::{
    load_lock, lock_path, safe_relative, spec_digest, write_lock, LockedModel, LockedSource,
    ResolvedLock, SourceEntry, SpecOptions, VersionSpec,
};

use crate::config::Config;
use crate::git::{repo_short_name, GitResolver};

/// Turn a validated spec into a [`ResolvedLock`]: every floating ref pinned
/// to a commit, every model's name and target path materialized.
///
/// Resolution is idempotent: for a spec whose upstream refs have not moved,
/// repeated runs produce byte-identical locks (`resolved_at` only advances
/// when the lock content is actually rewritten).
///
/// # Errors
///
/// Validation failures, ref-resolution failures (`network` /
/// `offline_unavailable`), and path-safety violations.
pub fn resolve_spec(config: &Config, spec: &VersionSpec) -> Result<ResolvedLock> {
    spec.validate().context("spec validation failed")?;
    // A spec may demand offline resolution even when the environment allows
    // network access.
    let offline_config;
    let config = if spec.options.offline && !config.offline {
        offline_config = Config {
            offline: true,
            ..config.clone()
        };
        &offline_config
    } else {
        config
    };
    let git = GitResolver::new(config);

    let engine_source = pin_source(&git, &spec.engine_source, None)?;
    let mut extensions = Vec::with_capacity(spec.extensions.len());
    for extension in &spec.extensions {
        let default_name = repo_short_name(&extension.repo);
        extensions.push(pin_source(&git, extension, Some(default_name))?);
    }

    let mut models = Vec::with_capacity(spec.models.len());
    for model in &spec.models {
        let name = model.effective_name();
        let target_path = match model.target_path.as_deref() {
            Some(path) => path.to_string(),
            None => {
                // Validation guarantees target_subdir is present here.
                let subdir = model.target_subdir.as_deref().unwrap_or_default();
                format!("{}/{name}", subdir.trim_end_matches('/'))
            }
        };
        safe_relative(&target_path)
            .with_context(|| format!("model '{name}' has an unsafe target path"))?;
        models.push(LockedModel {
            source: model.source.trim().to_string(),
            name,
            target_subdir: model.target_subdir.clone(),
            target_path,
            checksum: model.checksum.clone(),
        });
    }

    let digest = spec_digest(spec)?;
    let previous = load_lock(&lock_path(&config.cache_root, &spec.version_id))?;
    let mut lock = ResolvedLock {
        schema_version: spec.schema_version,
        version_id: spec.version_id.clone(),
        engine_source,
        extensions,
        models,
        extra_packages: spec.extra_packages.clone(),
        env: spec.env.clone(),
        options: spec.options,
        resolved_at: 0,
        spec_digest: digest,
    };
    lock.resolved_at = next_resolved_at(previous.as_ref(), &lock)?;
    debug!(version_id = %lock.version_id, resolved_at = lock.resolved_at, "spec resolved");
    Ok(lock)
}

/// Reuse the persisted lock when it was produced from this exact spec
/// (matching digest); resolve fresh otherwise.
///
/// This is what `realize` and the job handler call: a version pinned by an
/// earlier `validate` keeps materializing the same commits even after the
/// upstream refs move, and a warm workspace realizes without any network.
///
/// # Errors
///
/// Same as [`resolve_spec`].
pub fn resolve_or_reuse(config: &Config, spec: &VersionSpec) -> Result<ResolvedLock> {
    let digest = spec_digest(spec)?;
    if let Some(lock) = load_lock(&lock_path(&config.cache_root, &spec.version_id))? {
        if lock.spec_digest == digest {
            debug!(version_id = %lock.version_id, "reusing persisted lock");
            return Ok(lock);
        }
    }
    resolve_spec(config, spec)
}

/// Persist a lock at its canonical location and return the path.
///
/// # Errors
///
/// Returns an error when the atomic write fails.
pub fn save_lock(config: &Config, lock: &ResolvedLock) -> Result<PathBuf> {
    let path = lock_path(&config.cache_root, &lock.version_id);
    write_lock(&path, lock)?;
    info!(version_id = %lock.version_id, path = %path.display(), "resolved lock saved");
    Ok(path)
}

fn pin_source(
    git: &GitResolver<'_>,
    source: &SourceEntry,
    default_name: Option<String>,
) -> Result<LockedSource> {
    let commit = match &source.commit {
        Some(commit) => git.resolve(&source.repo, Some(commit))?,
        None => git.resolve(&source.repo, source.git_ref.as_deref())?,
    };
    Ok(LockedSource {
        repo: source.repo.trim().to_string(),
        git_ref: source.git_ref.clone(),
        commit,
        name: source
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or(default_name),
    })
}

/// Keep `resolved_at` monotonic while preserving byte-identical output for
/// unchanged inputs: an equivalent previous lock keeps its sequence number.
fn next_resolved_at(previous: Option<&ResolvedLock>, fresh: &ResolvedLock) -> Result<i64> {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let Some(previous) = previous else {
        return Ok(now);
    };
    let mut comparable = fresh.clone();
    comparable.resolved_at = previous.resolved_at;
    if comparable.canonical_bytes()? == previous.canonical_bytes()? {
        Ok(previous.resolved_at)
    } else {
        Ok(now.max(previous.resolved_at + 1))
    }
}
