use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use vx_domain::{load_lock, load_spec, lock_path, spec_path_for};

use crate::config::Config;
use crate::errors::{core_error, ErrorKind};
use crate::realize::{plan_lines, read_marker, realize, RealizeOptions};
use crate::resolver::{resolve_or_reuse, resolve_spec, save_lock};
use crate::ExecutionOutcome;

#[derive(Debug, Clone)]
pub struct ValidateRequest {
    pub version_id: String,
}

/// Resolve a spec, persist the lock, and report the realization plan.
///
/// # Errors
///
/// `validation` for a bad spec, resolution failures otherwise.
pub fn validate_version(config: &Config, request: &ValidateRequest) -> Result<ExecutionOutcome> {
    let spec = load_named_spec(config, &request.version_id)?;
    let lock = resolve_spec(config, &spec)?;
    let lock_file = save_lock(config, &lock)?;
    let plan = plan_lines(config, &lock, &RealizeOptions::default());

    Ok(ExecutionOutcome::success(
        format!("spec '{}' resolved", request.version_id),
        json!({
            "version_id": lock.version_id,
            "lock": lock_file.display().to_string(),
            "engine_commit": lock.engine_source.commit,
            "plan": plan,
        }),
    ))
}

#[derive(Debug, Clone, Default)]
pub struct RealizeRequest {
    pub version_id: String,
    pub target: Option<PathBuf>,
    pub models_dir: Option<PathBuf>,
    pub wheels_dir: Option<PathBuf>,
    pub dry_run: bool,
    pub overwrite: bool,
}

/// Resolve and realize a version into its workspace.
///
/// # Errors
///
/// Classified per phase: `realization`, `env_build`, `integrity`,
/// `offline_unavailable`, `network`.
pub fn realize_version(config: &Config, request: &RealizeRequest) -> Result<ExecutionOutcome> {
    let spec = load_named_spec(config, &request.version_id)?;
    // An existing lock from this exact spec wins; only `validate` re-pins.
    let lock = resolve_or_reuse(config, &spec)?;
    let opts = RealizeOptions {
        target: request.target.clone(),
        models_dir: request.models_dir.clone(),
        wheels_dir: request.wheels_dir.clone(),
        overwrite: request.overwrite,
    };
    let plan = plan_lines(config, &lock, &opts);

    if request.dry_run {
        return Ok(ExecutionOutcome::success(
            "dry run; no changes made",
            json!({ "version_id": lock.version_id, "plan": plan, "dry_run": true }),
        ));
    }

    let lock_file = save_lock(config, &lock)?;
    let realized = realize(config, &lock, &opts)?;

    let message = if realized.short_circuited {
        format!("workspace for '{}' already current", lock.version_id)
    } else if realized.warnings.is_empty() {
        format!("version '{}' realized", lock.version_id)
    } else {
        format!(
            "version '{}' realized with {} warning(s)",
            lock.version_id,
            realized.warnings.len()
        )
    };
    Ok(ExecutionOutcome::success(
        message,
        json!({
            "version_id": lock.version_id,
            "lock": lock_file.display().to_string(),
            "workspace": realized.workspace.display().to_string(),
            "models_dir": realized.models_dir.display().to_string(),
            "short_circuited": realized.short_circuited,
            "warnings": realized.warnings,
            "plan": plan,
        }),
    ))
}

#[derive(Debug, Clone, Default)]
pub struct DeleteRequest {
    pub version_id: String,
    pub target: Option<PathBuf>,
    pub remove_spec: bool,
    pub remove_model_symlinks: bool,
    /// Skip the marker safety check.
    pub force: bool,
}

/// Remove a version's workspace and lock, optionally its spec and any model
/// symlinks projected outside the workspace.
///
/// # Errors
///
/// `usage` when the target directory does not look like a vx workspace (no
/// marker) and `--force` was not given.
pub fn delete_version(config: &Config, request: &DeleteRequest) -> Result<ExecutionOutcome> {
    let workspace = request
        .target
        .clone()
        .unwrap_or_else(|| config.workspace_for(&request.version_id));
    let mut removed = Vec::new();

    if workspace.exists() {
        if read_marker(&workspace).is_none() && !request.force {
            return Err(core_error(
                ErrorKind::Usage,
                format!(
                    "{} has no workspace marker; refusing to delete (pass --force to override)",
                    workspace.display()
                ),
            ));
        }
        if request.remove_model_symlinks {
            remove_external_model_links(config, &request.version_id, &workspace);
        }
        fs::remove_dir_all(&workspace)
            .with_context(|| format!("failed to remove {}", workspace.display()))?;
        info!(workspace = %workspace.display(), "workspace removed");
        removed.push("workspace");
    } else {
        warn!(workspace = %workspace.display(), "workspace not found");
    }

    let lock_file = lock_path(&config.cache_root, &request.version_id);
    if lock_file.exists() {
        fs::remove_file(&lock_file)
            .with_context(|| format!("failed to remove {}", lock_file.display()))?;
        info!(lock = %lock_file.display(), "resolved lock removed");
        removed.push("lock");
    }

    if request.remove_spec {
        let spec_file = spec_path_for(&config.specs_root, &request.version_id);
        if spec_file.exists() {
            fs::remove_file(&spec_file)
                .with_context(|| format!("failed to remove {}", spec_file.display()))?;
            info!(spec = %spec_file.display(), "spec removed");
            removed.push("spec");
        } else {
            warn!("spec file not found");
        }
    }

    let message = if removed.is_empty() {
        format!("nothing to delete for '{}'", request.version_id)
    } else {
        format!("deleted {} for '{}'", removed.join(" + "), request.version_id)
    };
    Ok(ExecutionOutcome::success(
        message,
        json!({ "version_id": request.version_id, "removed": removed }),
    ))
}

/// Drop model symlinks that live under a `MODELS_DIR` override outside the
/// workspace; links inside the workspace go down with it anyway.
fn remove_external_model_links(config: &Config, version_id: &str, workspace: &std::path::Path) {
    let models_dir = config.models_dir_for(workspace);
    if models_dir.starts_with(workspace) {
        return;
    }
    let Ok(Some(lock)) = load_lock(&lock_path(&config.cache_root, version_id)) else {
        return;
    };
    for model in &lock.models {
        let link = models_dir.join(&model.target_path);
        let is_symlink = fs::symlink_metadata(&link)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if is_symlink {
            if let Err(err) = fs::remove_file(&link) {
                warn!(link = %link.display(), "failed to remove model symlink: {err}");
            }
        }
    }
}

fn load_named_spec(config: &Config, version_id: &str) -> Result<vx_domain::VersionSpec> {
    let path = spec_path_for(&config.specs_root, version_id);
    if !path.is_file() {
        return Err(core_error(
            ErrorKind::Validation,
            format!(
                "spec file not found for version '{version_id}': {}",
                path.display()
            ),
        ));
    }
    load_spec(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{create_version, CreateRequest};
    use crate::config::EnvSnapshot;
    use std::path::Path;

    fn config_at(root: &Path, offline: bool) -> Config {
        let cache = root.join("cache");
        let cache = cache.to_str().expect("utf8").to_string();
        let mut pairs = vec![("CACHE_ROOT", cache.as_str())];
        if offline {
            pairs.push(("OFFLINE", "1"));
        }
        let mut config = Config::from_snapshot(&EnvSnapshot::testing(&pairs));
        config.specs_root = root.to_path_buf();
        config
    }

    fn seed_pinned_spec(config: &Config, version_id: &str) {
        create_version(
            config,
            &CreateRequest {
                version_id: version_id.to_string(),
                engine: format!("https://git.example/engine/engine.git@{}", "a".repeat(40)),
                ..CreateRequest::default()
            },
        )
        .expect("create");
    }

    #[test]
    fn validate_resolves_and_persists_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_at(temp.path(), true);
        seed_pinned_spec(&config, "v1");

        let outcome = validate_version(
            &config,
            &ValidateRequest {
                version_id: "v1".to_string(),
            },
        )
        .expect("validate");
        assert_eq!(outcome.details["engine_commit"], "a".repeat(40));
        assert!(lock_path(&config.cache_root, "v1").is_file());
    }

    #[test]
    fn validate_missing_spec_is_validation_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_at(temp.path(), true);
        let err = validate_version(
            &config,
            &ValidateRequest {
                version_id: "ghost".to_string(),
            },
        )
        .expect_err("missing");
        assert_eq!(crate::errors::classify(&err), ErrorKind::Validation);
    }

    #[test]
    fn dry_run_realize_touches_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_at(temp.path(), true);
        seed_pinned_spec(&config, "v1");
        let target = temp.path().join("ws");

        let outcome = realize_version(
            &config,
            &RealizeRequest {
                version_id: "v1".to_string(),
                target: Some(target.clone()),
                dry_run: true,
                ..RealizeRequest::default()
            },
        )
        .expect("dry run");
        assert_eq!(outcome.details["dry_run"], true);
        assert!(!target.exists());
        // Dry run must not even write the lock.
        assert!(!lock_path(&config.cache_root, "v1").is_file());
    }

    #[test]
    fn delete_refuses_unmarked_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_at(temp.path(), true);
        let target = temp.path().join("precious");
        fs::create_dir_all(target.join("data")).expect("dir");

        let err = delete_version(
            &config,
            &DeleteRequest {
                version_id: "v1".to_string(),
                target: Some(target.clone()),
                ..DeleteRequest::default()
            },
        )
        .expect_err("refuse");
        assert_eq!(crate::errors::classify(&err), ErrorKind::Usage);
        assert!(target.exists());

        delete_version(
            &config,
            &DeleteRequest {
                version_id: "v1".to_string(),
                target: Some(target.clone()),
                force: true,
                ..DeleteRequest::default()
            },
        )
        .expect("forced");
        assert!(!target.exists());
    }

    #[test]
    fn delete_removes_lock_and_optionally_spec() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_at(temp.path(), true);
        seed_pinned_spec(&config, "v1");
        validate_version(
            &config,
            &ValidateRequest {
                version_id: "v1".to_string(),
            },
        )
        .expect("validate");
        assert!(lock_path(&config.cache_root, "v1").is_file());

        let outcome = delete_version(
            &config,
            &DeleteRequest {
                version_id: "v1".to_string(),
                remove_spec: true,
                ..DeleteRequest::default()
            },
        )
        .expect("delete");
        assert!(!lock_path(&config.cache_root, "v1").is_file());
        assert!(!spec_path_for(temp.path(), "v1").is_file());
        let removed = outcome.details["removed"].as_array().expect("removed");
        assert!(removed.iter().any(|v| v == "lock"));
        assert!(removed.iter().any(|v| v == "spec"));
    }
}
