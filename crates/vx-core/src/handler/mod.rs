//! The job handler: a serverless-style worker that realizes the requested
//! version, stages per-request inputs, rewrites the graph, drives the engine,
//! and delivers the result inline or to object storage.
//!
//! One job moves through `received -> realizing -> staging -> executing ->
//! uploading -> done`; every step may fall into `failed(kind)`, and staged
//! inputs are cleaned up on every terminal state.

mod engine;
mod graph;
mod payload;
mod stage;
mod upload;

pub use engine::{Artifact, EngineRunner, DEFAULT_EXEC_TIMEOUT, DEFAULT_READY_TIMEOUT};
pub use graph::rewrite_workflow;
pub use payload::{JobPayload, NamedImage, OutputMode, WorkflowInput};
pub use stage::{local_request_id, RequestContext};
pub use upload::{UploadResult, Uploader};

use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::{debug, info};

use vx_domain::{load_lock, load_spec, lock_path, spec_path_for};

use crate::config::{Config, ObjectStoreConfig};
use crate::errors::{classify, core_error, ErrorKind};
use crate::fetch::Fetcher;
use crate::realize::{realize, RealizeOptions};
use crate::resolver::{resolve_or_reuse, save_lock};

/// Observable job phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Received,
    Realizing,
    Staging,
    Executing,
    Uploading,
    Done,
}

impl JobState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Realizing => "realizing",
            Self::Staging => "staging",
            Self::Executing => "executing",
            Self::Uploading => "uploading",
            Self::Done => "done",
        }
    }
}

/// Successful job response, one arm per output mode.
#[derive(Debug, Clone)]
pub enum JobResponse {
    Object(UploadResult),
    Base64 { base64: String, size: u64 },
}

impl JobResponse {
    /// Wire shape per the handler contract.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Object(result) => {
                serde_json::to_value(result).unwrap_or_else(|_| json!({}))
            }
            Self::Base64 { base64, size } => json!({ "base64": base64, "size": size }),
        }
    }
}

/// Wire shape of a failed job.
#[must_use]
pub fn error_response(err: &anyhow::Error) -> Value {
    json!({
        "error": {
            "kind": classify(err).token(),
            "message": format!("{err:#}"),
        }
    })
}

/// Execute one job end to end.
///
/// # Errors
///
/// Any phase failure, classified per the error taxonomy; staged inputs are
/// removed before the error propagates.
pub fn run_job(config: &Config, payload: &JobPayload, request_id: &str) -> Result<JobResponse> {
    let mut state = JobState::Received;
    debug!(request_id, state = state.as_str(), "job accepted");

    // Phase: realizing.
    state = JobState::Realizing;
    let version_id = payload.require_version_id()?;
    let realized = ensure_realized(config, version_id, payload.models_dir.as_deref())?;
    debug!(request_id, state = state.as_str(), workspace = %realized.workspace.display(), "version ready");

    let output_mode = OutputMode::parse(
        payload
            .output_mode
            .as_deref()
            .unwrap_or(&config.output_mode),
    )?;
    let workflow_input = payload.workflow_input()?;

    // Phase: staging. From here on, cleanup must run on every exit.
    state = JobState::Staging;
    let mut request = RequestContext::new(request_id, &realized.workspace);
    let result = (|| -> Result<JobResponse> {
        let fetcher = Fetcher::new(config);
        let mut workflow = match workflow_input {
            WorkflowInput::Inline(value) => value,
            WorkflowInput::Url(url) => fetch_workflow(&fetcher, &url, &realized.workspace)?,
        };
        request.stage_inputs(&fetcher, &payload.merged_inputs())?;
        let rewritten = rewrite_workflow(&mut workflow, request.staged_inputs());
        debug!(request_id, rewritten, "workflow inputs rewritten");

        // Phase: executing.
        state = JobState::Executing;
        let lock_env: Vec<(String, String)> = load_lock(&lock_path(&config.cache_root, version_id))?
            .map(|lock| {
                lock.env
                    .iter()
                    .map(|(k, v)| (k.clone(), crate::config::expand_env_refs(v)))
                    .collect()
            })
            .unwrap_or_default();
        let mut runner = EngineRunner::new(
            &realized.workspace,
            &realized.models_dir,
            lock_env,
            payload.verbose,
        );
        runner.start()?;
        runner.wait_ready(DEFAULT_READY_TIMEOUT)?;
        let prompt_id = runner.submit(&workflow)?;
        info!(request_id, %prompt_id, "graph submitted");
        let outputs = runner.wait_complete(&prompt_id, DEFAULT_EXEC_TIMEOUT)?;
        let artifacts = runner.collect_artifacts(&outputs);
        runner.shutdown();
        let primary = artifacts.first().ok_or_else(|| {
            core_error(ErrorKind::EngineExec, "graph produced no artifacts")
        })?;

        // Phase: uploading / delivery.
        state = JobState::Uploading;
        match output_mode {
            OutputMode::Base64 => {
                let bytes = std::fs::read(&primary.path).with_context(|| {
                    format!("failed to read artifact {}", primary.path.display())
                })?;
                Ok(JobResponse::Base64 {
                    base64: BASE64.encode(&bytes),
                    size: bytes.len() as u64,
                })
            }
            OutputMode::Object => {
                let store_config = object_config(config, payload);
                let uploader = Uploader::new(&store_config);
                let extension = PathBuf::from(&primary.filename)
                    .extension()
                    .and_then(|e| e.to_str().map(ToOwned::to_owned))
                    .unwrap_or_else(|| "bin".to_string());
                let result = uploader.upload(&primary.path, request_id, &extension)?;
                Ok(JobResponse::Object(result))
            }
        }
    })();

    // Cleanup runs on success and on every failed(kind) alike.
    request.cleanup();
    let state = if result.is_ok() { JobState::Done } else { state };
    debug!(request_id, state = state.as_str(), ok = result.is_ok(), "job finished");
    result
}

/// Resolve and realize a version by id, reusing an existing lock's workspace
/// when it is already warm.
fn ensure_realized(
    config: &Config,
    version_id: &str,
    models_dir: Option<&str>,
) -> Result<crate::realize::Realized> {
    let spec_path = spec_path_for(&config.specs_root, version_id);
    if !spec_path.is_file() {
        return Err(core_error(
            ErrorKind::Validation,
            format!(
                "spec file not found for version '{version_id}': {}",
                spec_path.display()
            ),
        ));
    }
    let spec = load_spec(&spec_path)?;
    let lock = resolve_or_reuse(config, &spec)?;
    save_lock(config, &lock)?;
    let opts = RealizeOptions {
        models_dir: models_dir.map(PathBuf::from),
        ..RealizeOptions::default()
    };
    realize(config, &lock, &opts)
}

fn fetch_workflow(fetcher: &Fetcher<'_>, url: &str, workspace: &std::path::Path) -> Result<Value> {
    let dest = workspace.join("temp").join(format!(
        "workflow.{}.{:08x}.json",
        std::process::id(),
        rand::random::<u32>()
    ));
    fetcher
        .fetch_to(url, &dest)
        .with_context(|| format!("failed to download workflow from {url}"))?;
    let contents = std::fs::read_to_string(&dest)
        .with_context(|| format!("failed to read {}", dest.display()))?;
    std::fs::remove_file(&dest).ok();
    serde_json::from_str(&contents)
        .map_err(|err| core_error(ErrorKind::Usage, format!("workflow at {url} is not JSON: {err}")))
}

/// Payload fields override the environment-derived uploader config.
fn object_config(config: &Config, payload: &JobPayload) -> ObjectStoreConfig {
    let mut store = config.object_store.clone();
    if let Some(bucket) = &payload.object_bucket {
        store.bucket = Some(bucket.clone());
    }
    if let Some(prefix) = &payload.object_prefix {
        store.prefix = prefix.clone();
    }
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvSnapshot;

    #[test]
    fn job_states_report_in_order() {
        let states = [
            JobState::Received,
            JobState::Realizing,
            JobState::Staging,
            JobState::Executing,
            JobState::Uploading,
            JobState::Done,
        ];
        let tokens: Vec<_> = states.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            tokens,
            vec!["received", "realizing", "staging", "executing", "uploading", "done"]
        );
    }

    #[test]
    fn error_response_shape_carries_kind_token() {
        let err = core_error(ErrorKind::EngineExec, "graph failed: oom");
        let body = error_response(&err);
        assert_eq!(body["error"]["kind"], "engine_exec");
        assert!(body["error"]["message"]
            .as_str()
            .expect("message")
            .contains("oom"));
    }

    #[test]
    fn base64_response_shape() {
        let response = JobResponse::Base64 {
            base64: "aGk=".to_string(),
            size: 2,
        };
        let body = response.to_json();
        assert_eq!(body["base64"], "aGk=");
        assert_eq!(body["size"], 2);
    }

    #[test]
    fn object_config_prefers_payload_overrides() {
        let config = Config::from_snapshot(&EnvSnapshot::testing(&[
            ("OBJECT_BUCKET", "env-bucket"),
            ("OBJECT_PREFIX", "env/prefix"),
        ]));
        let payload = JobPayload {
            object_bucket: Some("payload-bucket".to_string()),
            ..JobPayload::default()
        };
        let store = object_config(&config, &payload);
        assert_eq!(store.bucket.as_deref(), Some("payload-bucket"));
        assert_eq!(store.prefix, "env/prefix");
    }

    #[test]
    fn missing_spec_is_a_validation_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = Config::from_snapshot(&EnvSnapshot::testing(&[(
            "CACHE_ROOT",
            temp.path().join("cache").to_str().expect("utf8"),
        )]));
        config.specs_root = temp.path().to_path_buf();
        let err = ensure_realized(&config, "ghost", None).expect_err("no spec");
        assert_eq!(classify(&err), ErrorKind::Validation);
    }
}
