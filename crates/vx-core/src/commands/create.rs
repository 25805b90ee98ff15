use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::warn;

use vx_domain::{
    load_spec, spec_path_for, write_spec, ChecksumAlgo, ModelEntry, SourceEntry, SpecOptions,
    VersionSpec, SCHEMA_VERSION,
};

use crate::config::Config;
use crate::errors::{core_error, ErrorKind};
use crate::fsx::file_checksum;
use crate::ExecutionOutcome;

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub version_id: String,
    /// Engine repo URL, optionally `@ref`.
    pub engine: String,
    /// Extension declarations: `repo[@ref]` shorthand or inline JSON objects.
    pub extensions: Vec<String>,
    /// Model declarations: inline JSON objects.
    pub models: Vec<String>,
    /// JSON file containing a list of extension objects.
    pub extensions_file: Option<PathBuf>,
    /// JSON file containing a list of model objects.
    pub models_file: Option<PathBuf>,
    /// Base directory with local model files for `--auto-checksum`.
    pub models_root: Option<PathBuf>,
    pub auto_checksum: bool,
    pub output: Option<PathBuf>,
    pub force: bool,
}

/// Build and write a spec file from CLI arguments. Refs are recorded as
/// given; pinning happens at `validate`.
///
/// # Errors
///
/// `usage` for unparseable declarations, `validation` for a spec that fails
/// structural checks, plus IO failures.
pub fn create_version(config: &Config, request: &CreateRequest) -> Result<ExecutionOutcome> {
    let (repo, git_ref) = split_repo_ref(&request.engine)?;
    let engine_source = SourceEntry {
        repo,
        git_ref: git_ref.or_else(|| Some("HEAD".to_string())),
        commit: None,
        name: None,
    };

    let mut extensions = Vec::new();
    if let Some(file) = &request.extensions_file {
        extensions.extend(parse_entries_file::<SourceEntry>(file, "extensions")?);
    }
    for declaration in &request.extensions {
        extensions.push(parse_extension(declaration)?);
    }

    let mut models = Vec::new();
    if let Some(file) = &request.models_file {
        models.extend(parse_entries_file::<ModelEntry>(file, "models")?);
    }
    for declaration in &request.models {
        models.push(parse_model(declaration)?);
    }
    if request.auto_checksum {
        fill_checksums(config, &mut models, request.models_root.as_deref());
    }

    let spec = VersionSpec {
        schema_version: SCHEMA_VERSION,
        version_id: request.version_id.clone(),
        engine_source,
        extensions,
        models,
        extra_packages: Vec::new(),
        env: BTreeMap::new(),
        options: SpecOptions::default(),
    };
    spec.validate()?;

    let path = request
        .output
        .clone()
        .unwrap_or_else(|| spec_path_for(&config.specs_root, &request.version_id));
    if path.exists() && !request.force {
        return Err(core_error(
            ErrorKind::Usage,
            format!("{} already exists (pass --force to overwrite)", path.display()),
        ));
    }
    write_spec(&path, &spec)?;

    Ok(ExecutionOutcome::success(
        format!("spec written to {}", path.display()),
        json!({
            "version_id": spec.version_id,
            "path": path.display().to_string(),
            "extensions": spec.extensions.len(),
            "models": spec.models.len(),
        }),
    ))
}

#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub source_version: String,
    pub new_version: String,
    pub output: Option<PathBuf>,
    pub force: bool,
}

/// Copy a spec under a new version id. Locks and workspaces are not copied;
/// the clone resolves fresh on its first `validate`.
///
/// # Errors
///
/// `validation` when the source spec is missing or invalid, `usage` when the
/// destination exists without `--force`.
pub fn clone_version(config: &Config, request: &CloneRequest) -> Result<ExecutionOutcome> {
    let source_path = spec_path_for(&config.specs_root, &request.source_version);
    if !source_path.is_file() {
        return Err(core_error(
            ErrorKind::Validation,
            format!(
                "spec file not found for version '{}': {}",
                request.source_version,
                source_path.display()
            ),
        ));
    }
    let mut spec = load_spec(&source_path)?;
    spec.version_id = request.new_version.clone();
    spec.validate()?;

    let output = request
        .output
        .clone()
        .unwrap_or_else(|| spec_path_for(&config.specs_root, &request.new_version));
    if output.exists() && !request.force {
        return Err(core_error(
            ErrorKind::Usage,
            format!("{} already exists (pass --force to overwrite)", output.display()),
        ));
    }
    write_spec(&output, &spec)?;

    Ok(ExecutionOutcome::success(
        format!(
            "version {} cloned to {}",
            request.source_version,
            output.display()
        ),
        json!({
            "source": request.source_version,
            "new_version": request.new_version,
            "path": output.display().to_string(),
        }),
    ))
}

/// Split `repo[@ref]`, leaving scheme userinfo (`https://user@host`) and
/// scp-style `git@host:path` addresses intact.
pub(crate) fn split_repo_ref(raw: &str) -> Result<(String, Option<String>)> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(core_error(ErrorKind::Usage, "empty repository value"));
    }
    if value.starts_with("git@") && value.matches('@').count() == 1 {
        return Ok((value.to_string(), None));
    }
    let Some(idx) = value.rfind('@') else {
        return Ok((value.to_string(), None));
    };
    if let Some(scheme_idx) = value.find("://") {
        if idx < scheme_idx + 3 {
            return Ok((value.to_string(), None));
        }
    }
    let (repo, git_ref) = value.split_at(idx);
    let git_ref = &git_ref[1..];
    if git_ref.is_empty() {
        Ok((repo.to_string(), None))
    } else {
        Ok((repo.to_string(), Some(git_ref.to_string())))
    }
}

fn parse_extension(declaration: &str) -> Result<SourceEntry> {
    let trimmed = declaration.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed).map_err(|err| {
            core_error(
                ErrorKind::Usage,
                format!("extension declaration is not a valid JSON object: {err}"),
            )
        });
    }
    let (repo, git_ref) = split_repo_ref(trimmed)?;
    Ok(SourceEntry {
        repo,
        git_ref,
        commit: None,
        name: None,
    })
}

fn parse_model(declaration: &str) -> Result<ModelEntry> {
    serde_json::from_str(declaration.trim()).map_err(|err| {
        core_error(
            ErrorKind::Usage,
            format!("model declaration must be a JSON object: {err}"),
        )
    })
}

fn parse_entries_file<T: serde::de::DeserializeOwned>(
    path: &PathBuf,
    what: &str,
) -> Result<Vec<T>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {} file {}", what, path.display()))?;
    serde_json::from_str(&contents).map_err(|err| {
        core_error(
            ErrorKind::Usage,
            format!("{} file {} must be a JSON list: {err}", what, path.display()),
        )
    })
}

/// Compute sha256 for models that declare none, when the file already exists
/// under the local models root.
fn fill_checksums(config: &Config, models: &mut [ModelEntry], models_root: Option<&std::path::Path>) {
    let root = models_root
        .map(std::path::Path::to_path_buf)
        .or_else(|| config.models_dir.clone());
    let Some(root) = root else {
        warn!("--auto-checksum given but no models root is known; skipping");
        return;
    };
    for model in models.iter_mut() {
        if model.checksum.is_some() {
            continue;
        }
        let name = model.effective_name();
        let relative = model
            .target_path
            .clone()
            .unwrap_or_else(|| match &model.target_subdir {
                Some(subdir) => format!("{}/{name}", subdir.trim_end_matches('/')),
                None => name.clone(),
            });
        let candidate = root.join(&relative);
        if !candidate.is_file() {
            warn!(model = %name, path = %candidate.display(), "local model file not found; checksum left empty");
            continue;
        }
        match file_checksum(&candidate, ChecksumAlgo::Sha256) {
            Ok(sum) => model.checksum = Some(sum.to_string()),
            Err(err) => warn!(model = %name, "failed to compute checksum: {err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvSnapshot;
    use std::path::Path;

    fn config_at(root: &Path) -> Config {
        let mut config = Config::from_snapshot(&EnvSnapshot::testing(&[(
            "CACHE_ROOT",
            root.join("cache").to_str().expect("utf8"),
        )]));
        config.specs_root = root.to_path_buf();
        config
    }

    #[test]
    fn split_repo_ref_handles_the_awkward_cases() {
        assert_eq!(
            split_repo_ref("https://git.example/a/b.git@main").expect("ok"),
            (
                "https://git.example/a/b.git".to_string(),
                Some("main".to_string())
            )
        );
        assert_eq!(
            split_repo_ref("https://user@git.example/a/b.git").expect("ok"),
            ("https://user@git.example/a/b.git".to_string(), None)
        );
        assert_eq!(
            split_repo_ref("git@git.example:a/b.git").expect("ok"),
            ("git@git.example:a/b.git".to_string(), None)
        );
        assert_eq!(
            split_repo_ref("https://git.example/a/b.git@").expect("ok"),
            ("https://git.example/a/b.git".to_string(), None)
        );
        assert!(split_repo_ref("  ").is_err());
    }

    #[test]
    fn create_writes_a_valid_spec() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_at(temp.path());
        let request = CreateRequest {
            version_id: "demo".to_string(),
            engine: "https://git.example/engine/engine.git@v1.2".to_string(),
            extensions: vec!["https://git.example/nodes/upscaler.git@main".to_string()],
            models: vec![
                r#"{"source": "hub://org/repo/x.safetensors", "target_subdir": "checkpoints"}"#
                    .to_string(),
            ],
            ..CreateRequest::default()
        };
        create_version(&config, &request).expect("create");

        let spec = load_spec(&spec_path_for(temp.path(), "demo")).expect("load");
        assert_eq!(spec.engine_source.git_ref.as_deref(), Some("v1.2"));
        assert_eq!(spec.extensions.len(), 1);
        assert_eq!(spec.models[0].target_subdir.as_deref(), Some("checkpoints"));

        // A second create without --force must refuse.
        let err = create_version(&config, &request).expect_err("exists");
        assert_eq!(crate::errors::classify(&err), ErrorKind::Usage);
    }

    #[test]
    fn create_rejects_unsafe_model_declarations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_at(temp.path());
        let request = CreateRequest {
            version_id: "bad".to_string(),
            engine: "https://git.example/engine/engine.git".to_string(),
            models: vec![
                r#"{"source": "https://host/m.bin", "target_path": "../../escape"}"#.to_string(),
            ],
            ..CreateRequest::default()
        };
        let err = create_version(&config, &request).expect_err("unsafe");
        assert_eq!(crate::errors::classify(&err), ErrorKind::Validation);
    }

    #[test]
    fn clone_rewrites_only_the_version_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_at(temp.path());
        create_version(
            &config,
            &CreateRequest {
                version_id: "v1".to_string(),
                engine: "https://git.example/engine/engine.git@main".to_string(),
                ..CreateRequest::default()
            },
        )
        .expect("create");

        clone_version(
            &config,
            &CloneRequest {
                source_version: "v1".to_string(),
                new_version: "v2".to_string(),
                output: None,
                force: false,
            },
        )
        .expect("clone");

        let original = load_spec(&spec_path_for(temp.path(), "v1")).expect("v1");
        let cloned = load_spec(&spec_path_for(temp.path(), "v2")).expect("v2");
        assert_eq!(cloned.version_id, "v2");
        assert_eq!(cloned.engine_source, original.engine_source);
    }

    #[test]
    fn auto_checksum_fills_only_local_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_at(temp.path());
        let models_root = temp.path().join("models");
        fs::create_dir_all(models_root.join("checkpoints")).expect("dir");
        fs::write(models_root.join("checkpoints/here.bin"), b"bytes").expect("file");

        let request = CreateRequest {
            version_id: "sums".to_string(),
            engine: "https://git.example/engine/engine.git@main".to_string(),
            models: vec![
                r#"{"source": "https://host/here.bin", "target_subdir": "checkpoints"}"#
                    .to_string(),
                r#"{"source": "https://host/absent.bin", "target_subdir": "checkpoints"}"#
                    .to_string(),
            ],
            models_root: Some(models_root),
            auto_checksum: true,
            ..CreateRequest::default()
        };
        create_version(&config, &request).expect("create");

        let spec = load_spec(&spec_path_for(temp.path(), "sums")).expect("load");
        assert!(spec.models[0]
            .checksum
            .as_deref()
            .expect("checksum")
            .starts_with("sha256:"));
        assert!(spec.models[1].checksum.is_none());
    }
}
