use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::info;

use crate::config::{expand_env_refs, Config};
use crate::envbuild::select_python;
use crate::errors::{core_error, ErrorKind};
use crate::handler::{local_request_id, run_job, JobPayload, JobResponse, NamedImage};
use crate::process::run_command_passthrough;
use crate::realize::{realize, RealizeOptions};
use crate::resolver::{resolve_or_reuse, save_lock};
use crate::ExecutionOutcome;

#[derive(Debug, Clone)]
pub struct RunUiRequest {
    pub version_id: String,
    pub host: String,
    pub port: u16,
    pub target: Option<PathBuf>,
    pub models_dir: Option<PathBuf>,
    pub wheels_dir: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

/// Realize a version, then hand the terminal over to the engine's interactive
/// server until it exits.
///
/// # Errors
///
/// Realization failures, or `engine_start` when the entrypoint is missing.
pub fn run_ui(config: &Config, request: &RunUiRequest) -> Result<ExecutionOutcome> {
    let spec_path = vx_domain::spec_path_for(&config.specs_root, &request.version_id);
    if !spec_path.is_file() {
        return Err(core_error(
            ErrorKind::Validation,
            format!(
                "spec file not found for version '{}': {}",
                request.version_id,
                spec_path.display()
            ),
        ));
    }
    let spec = vx_domain::load_spec(&spec_path)?;
    let lock = resolve_or_reuse(config, &spec)?;
    save_lock(config, &lock)?;
    let realized = realize(
        config,
        &lock,
        &RealizeOptions {
            target: request.target.clone(),
            models_dir: request.models_dir.clone(),
            wheels_dir: request.wheels_dir.clone(),
            overwrite: false,
        },
    )?;

    let entrypoint = realized.workspace.join("engine").join("main.py");
    if !entrypoint.is_file() {
        return Err(core_error(
            ErrorKind::EngineStart,
            format!("engine entrypoint not found: {}", entrypoint.display()),
        ));
    }
    let python = select_python(&realized.workspace)?;

    let mut args = vec![
        entrypoint.display().to_string(),
        "--listen".to_string(),
        request.host.clone(),
        "--port".to_string(),
        request.port.to_string(),
    ];
    let mut extra = request.extra_args.clone();
    if extra.first().map(String::as_str) == Some("--") {
        extra.remove(0);
    }
    args.extend(extra);

    let mut envs: Vec<(String, String)> = lock
        .env
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_refs(v)))
        .collect();
    envs.push((
        "ENGINE_HOME".to_string(),
        realized.workspace.display().to_string(),
    ));
    envs.push((
        "MODELS_DIR".to_string(),
        realized.models_dir.display().to_string(),
    ));

    info!(
        host = %request.host,
        port = request.port,
        workspace = %realized.workspace.display(),
        "launching interactive engine server"
    );
    let code = run_command_passthrough(
        &python.display().to_string(),
        &args,
        &envs,
        Some(&realized.workspace.join("engine")),
    )?;

    Ok(ExecutionOutcome::success(
        format!("engine exited with code {code}"),
        json!({ "exit_code": code, "workspace": realized.workspace.display().to_string() }),
    ))
}

#[derive(Debug, Clone, Default)]
pub struct RunHandlerRequest {
    pub version_id: String,
    pub workflow_file: PathBuf,
    pub output_mode: Option<String>,
    pub out_file: Option<PathBuf>,
    pub object_bucket: Option<String>,
    pub object_prefix: Option<String>,
    pub models_dir: Option<PathBuf>,
    pub input_images: Vec<(String, String)>,
    pub verbose: bool,
}

/// Execute one graph job headlessly, exactly as the serverless worker would,
/// and emit the response.
///
/// # Errors
///
/// Any job-phase failure, classified per the error taxonomy.
pub fn run_handler(config: &Config, request: &RunHandlerRequest) -> Result<ExecutionOutcome> {
    let workflow_text = fs::read_to_string(&request.workflow_file).map_err(|err| {
        core_error(
            ErrorKind::Usage,
            format!(
                "failed to read workflow {}: {err}",
                request.workflow_file.display()
            ),
        )
    })?;
    let workflow: Value = serde_json::from_str(&workflow_text).map_err(|err| {
        core_error(
            ErrorKind::Usage,
            format!(
                "workflow {} is not valid JSON: {err}",
                request.workflow_file.display()
            ),
        )
    })?;

    let payload = JobPayload {
        version_id: Some(request.version_id.clone()),
        workflow: Some(workflow),
        workflow_url: None,
        input_images: request
            .input_images
            .iter()
            .cloned()
            .collect(),
        images: Vec::<NamedImage>::new(),
        output_mode: request.output_mode.clone(),
        object_bucket: request.object_bucket.clone(),
        object_prefix: request.object_prefix.clone(),
        models_dir: request.models_dir.as_ref().map(|p| p.display().to_string()),
        verbose: request.verbose,
    };

    let request_id = local_request_id();
    let response = run_job(config, &payload, &request_id)?;

    let mut body = response.to_json();
    if let (Some(out_file), JobResponse::Base64 { base64, size }) =
        (&request.out_file, &response)
    {
        fs::write(out_file, base64)
            .with_context(|| format!("failed to write {}", out_file.display()))?;
        info!(out_file = %out_file.display(), "base64 artifact written");
        // Keep the envelope small once the payload is on disk.
        body = json!({ "out_file": out_file.display().to_string(), "size": size });
    }
    let message = match &response {
        JobResponse::Object(result) => format!("artifact uploaded to {}", result.object_url),
        JobResponse::Base64 { size, .. } => format!("artifact returned inline ({size} bytes)"),
    };
    Ok(ExecutionOutcome::success(
        message,
        json!({ "request_id": request_id, "response": body }),
    ))
}
