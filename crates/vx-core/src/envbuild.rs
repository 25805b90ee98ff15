//! Per-workspace interpreter environments: a `.venv` owned exclusively by one
//! workspace, populated from the engine's requirements, each extension's
//! requirements (in spec order), then the spec's extra packages so they may
//! override. Also emits the model-search-paths config handed to the engine.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use vx_domain::ResolvedLock;

use crate::errors::{core_error, ErrorKind};
use crate::process::run_command;

/// File name of the generated model-search-paths config.
pub const MODEL_PATHS_CONFIG: &str = "extra_model_paths.yaml";

/// Interpreter path inside a workspace venv.
#[must_use]
pub fn venv_python(workspace: &Path) -> PathBuf {
    workspace.join(".venv").join("bin").join("python")
}

/// Pick the interpreter used to run the engine: the workspace venv when it
/// exists, else the system python.
///
/// # Errors
///
/// Returns an error when no interpreter can be found at all.
pub fn select_python(workspace: &Path) -> Result<PathBuf> {
    let venv = venv_python(workspace);
    if venv.is_file() {
        return Ok(venv);
    }
    system_python()
}

fn system_python() -> Result<PathBuf> {
    for candidate in ["python3", "python"] {
        if let Ok(found) = which::which(candidate) {
            return Ok(found);
        }
    }
    Err(core_error(
        ErrorKind::EnvBuild,
        "no python interpreter found on PATH",
    ))
}

/// Build or refresh the workspace environment from a resolved lock.
///
/// # Errors
///
/// `env_build` on interpreter or install failures; `offline_unavailable` when
/// offline-wheels installs cannot be satisfied.
pub fn build_env(
    workspace: &Path,
    models_dir: &Path,
    lock: &ResolvedLock,
    wheels_dir: Option<&Path>,
    offline: bool,
) -> Result<()> {
    let python = ensure_venv(workspace)?;

    let engine_requirements = workspace.join("engine").join("requirements.txt");
    if engine_requirements.is_file() {
        pip_install_requirements(&python, &engine_requirements, wheels_dir, offline)?;
    } else {
        warn!(
            path = %engine_requirements.display(),
            "engine declares no requirements file; skipping core install"
        );
    }

    for extension in &lock.extensions {
        let name = extension.name.as_deref().unwrap_or("extension");
        let requirements = workspace
            .join("custom_nodes")
            .join(name)
            .join("requirements.txt");
        if requirements.is_file() {
            pip_install_requirements(&python, &requirements, wheels_dir, offline)?;
        } else {
            debug!(extension = name, "no requirements.txt; nothing to install");
        }
    }

    if !lock.extra_packages.is_empty() {
        pip_install_packages(&python, &lock.extra_packages, wheels_dir, offline)?;
    }

    write_model_paths_config(workspace, models_dir)?;
    Ok(())
}

fn ensure_venv(workspace: &Path) -> Result<PathBuf> {
    let python = venv_python(workspace);
    if python.is_file() {
        debug!(python = %python.display(), "reusing existing venv");
        return Ok(python);
    }
    let base = system_python()?;
    let venv_dir = workspace.join(".venv");
    info!(venv = %venv_dir.display(), "creating virtual environment");
    let output = run_command(
        &base.display().to_string(),
        &[
            "-m".to_string(),
            "venv".to_string(),
            venv_dir.display().to_string(),
        ],
        &[],
        None,
    )?;
    if !output.success() {
        return Err(core_error(
            ErrorKind::EnvBuild,
            format!(
                "failed to create venv at {} ({}): {}",
                venv_dir.display(),
                output.code,
                output.failure_detail()
            ),
        ));
    }
    Ok(python)
}

fn pip_install_requirements(
    python: &Path,
    requirements: &Path,
    wheels_dir: Option<&Path>,
    offline: bool,
) -> Result<()> {
    let mut args = vec![
        "-m".to_string(),
        "pip".to_string(),
        "install".to_string(),
        "-r".to_string(),
        requirements.display().to_string(),
    ];
    push_wheel_args(&mut args, wheels_dir);
    info!(requirements = %requirements.display(), "installing requirements");
    run_pip(python, &args, offline)
}

fn pip_install_packages(
    python: &Path,
    packages: &[String],
    wheels_dir: Option<&Path>,
    offline: bool,
) -> Result<()> {
    let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string()];
    args.extend(packages.iter().cloned());
    push_wheel_args(&mut args, wheels_dir);
    info!(count = packages.len(), "installing extra packages");
    run_pip(python, &args, offline)
}

fn push_wheel_args(args: &mut Vec<String>, wheels_dir: Option<&Path>) {
    if let Some(wheels) = wheels_dir {
        args.push("--no-index".to_string());
        args.push("--find-links".to_string());
        args.push(wheels.display().to_string());
    }
}

fn run_pip(python: &Path, args: &[String], offline: bool) -> Result<()> {
    let output = run_command(&python.display().to_string(), args, &[], None)?;
    if output.success() {
        return Ok(());
    }
    let detail = output.failure_detail().to_string();
    // With --no-index a missing wheel surfaces as "no matching distribution";
    // in offline mode that is a cache problem, not a build problem.
    if offline {
        return Err(core_error(
            ErrorKind::OfflineUnavailable,
            format!("offline install failed ({}): {detail}", output.code),
        ));
    }
    Err(core_error(
        ErrorKind::EnvBuild,
        format!("pip install failed ({}): {detail}", output.code),
    ))
}

/// Emit the model-search-paths config: one document section pointing the
/// engine at the projected symlink tree, with an entry per model category
/// found under the models directory.
///
/// # Errors
///
/// Returns an error when the directory cannot be listed or the file written.
pub fn write_model_paths_config(workspace: &Path, models_dir: &Path) -> Result<PathBuf> {
    let mut categories: Vec<String> = match fs::read_dir(models_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect(),
        Err(_) => Vec::new(),
    };
    categories.sort();

    let mut doc = String::new();
    let _ = writeln!(doc, "vx:");
    let _ = writeln!(doc, "  base_path: {}", workspace.display());
    let _ = writeln!(doc, "  is_default: true");
    for category in &categories {
        let _ = writeln!(doc, "  {category}: {}", models_dir.join(category).display());
    }

    let path = workspace.join(MODEL_PATHS_CONFIG);
    fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create {}", workspace.display()))?;
    fs::write(&path, doc).with_context(|| format!("failed to write {}", path.display()))?;
    debug!(path = %path.display(), categories = categories.len(), "model paths config written");
    Ok(path)
}
