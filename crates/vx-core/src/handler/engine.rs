//! Engine subprocess orchestration: launch the graph executor headlessly,
//! poll its local HTTP API until ready, submit one graph, wait for the
//! history to report completion, and collect the produced files. The engine's
//! whole process group is terminated on shutdown or timeout, not just the
//! parent pid.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::envbuild::{select_python, MODEL_PATHS_CONFIG};
use crate::errors::{core_error, ErrorKind};

const ENGINE_PORT: u16 = 8188;
const LOG_TAIL_LINES: usize = 20;
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);
const READY_POLL: Duration = Duration::from_secs(1);
const EXEC_POLL: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// One produced output file, as named by the engine's history.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub filename: String,
    pub path: PathBuf,
}

pub struct EngineRunner {
    workspace: PathBuf,
    models_dir: PathBuf,
    env: Vec<(String, String)>,
    verbose: bool,
    child: Option<Child>,
    tail: Arc<Mutex<VecDeque<String>>>,
    readers: Vec<JoinHandle<()>>,
}

impl EngineRunner {
    #[must_use]
    pub fn new(
        workspace: &Path,
        models_dir: &Path,
        env: Vec<(String, String)>,
        verbose: bool,
    ) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            models_dir: models_dir.to_path_buf(),
            env,
            verbose,
            child: None,
            tail: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_TAIL_LINES))),
            readers: Vec::new(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{ENGINE_PORT}{path}")
    }

    /// Launch the engine headlessly inside the workspace.
    ///
    /// # Errors
    ///
    /// `engine_start` when the entrypoint is missing or the spawn fails.
    pub fn start(&mut self) -> Result<()> {
        let entrypoint = self.workspace.join("engine").join("main.py");
        if !entrypoint.is_file() {
            return Err(core_error(
                ErrorKind::EngineStart,
                format!("engine entrypoint not found: {}", entrypoint.display()),
            ));
        }
        for subdir in ["input", "output", "temp"] {
            std::fs::create_dir_all(self.workspace.join(subdir))
                .with_context(|| format!("failed to prepare workspace {subdir} directory"))?;
        }

        let python = select_python(&self.workspace)?;
        let mut command = Command::new(&python);
        command
            .arg(&entrypoint)
            .arg("--listen")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(ENGINE_PORT.to_string())
            .arg("--disable-auto-launch")
            .arg("--output-directory")
            .arg(self.workspace.join("output"))
            .arg("--input-directory")
            .arg(self.workspace.join("input"))
            .arg("--extra-model-paths-config")
            .arg(self.workspace.join(MODEL_PATHS_CONFIG))
            .current_dir(self.workspace.join("engine"))
            .env("ENGINE_HOME", &self.workspace)
            .env("MODELS_DIR", &self.models_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so shutdown can take workers down with it.
            command.process_group(0);
        }

        info!(python = %python.display(), "launching engine");
        let mut child = command.spawn().map_err(|err| {
            core_error(
                ErrorKind::EngineStart,
                format!("failed to launch engine: {err}"),
            )
        })?;

        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(stderr, "stderr");
        }
        self.child = Some(child);
        Ok(())
    }

    fn spawn_reader(&mut self, stream: impl std::io::Read + Send + 'static, label: &'static str) {
        let tail = Arc::clone(&self.tail);
        let verbose = self.verbose;
        self.readers.push(std::thread::spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let text = line.trim_end().to_string();
                if text.is_empty() {
                    continue;
                }
                if verbose {
                    info!("[engine:{label}] {text}");
                }
                let mut tail = tail.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if tail.len() == LOG_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(text);
            }
        }));
    }

    fn tail_snapshot(&self) -> String {
        self.tail
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(" | ")
    }

    fn process_died(&mut self) -> bool {
        self.child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
            .is_some()
    }

    /// Poll the status endpoints until the engine answers or `timeout` runs
    /// out.
    ///
    /// # Errors
    ///
    /// `engine_start`, with the last log lines attached for diagnosis.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let client = Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .context("failed to build readiness client")?;
        let started = Instant::now();
        loop {
            if self.process_died() {
                return Err(core_error(
                    ErrorKind::EngineStart,
                    format!(
                        "engine exited during startup; last output: {}",
                        self.tail_snapshot()
                    ),
                ));
            }
            for endpoint in ["/", "/queue"] {
                if let Ok(response) = client.get(self.api_url(endpoint)).send() {
                    if response.status().is_success() {
                        debug!(endpoint, "engine is ready");
                        return Ok(());
                    }
                }
            }
            if started.elapsed() >= timeout {
                return Err(core_error(
                    ErrorKind::EngineStart,
                    format!(
                        "engine not ready after {}s; last output: {}",
                        timeout.as_secs(),
                        self.tail_snapshot()
                    ),
                ));
            }
            std::thread::sleep(READY_POLL);
        }
    }

    /// Submit a graph over the local HTTP API; returns the prompt id.
    ///
    /// # Errors
    ///
    /// `engine_exec` when the submission is rejected.
    pub fn submit(&self, workflow: &Value) -> Result<String> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build submit client")?;
        let body = json!({ "prompt": workflow, "client_id": "vx-handler" });
        let response = client
            .post(self.api_url("/prompt"))
            .json(&body)
            .send()
            .map_err(|err| {
                core_error(ErrorKind::EngineExec, format!("graph submission failed: {err}"))
            })?;
        let status = response.status();
        let reply: Value = response.json().unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(core_error(
                ErrorKind::EngineExec,
                format!("engine rejected the graph ({status}): {reply}"),
            ));
        }
        reply
            .get("prompt_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                core_error(
                    ErrorKind::EngineExec,
                    format!("engine returned no prompt_id: {reply}"),
                )
            })
    }

    /// Poll the history endpoint until the prompt completes; returns the
    /// outputs document.
    ///
    /// # Errors
    ///
    /// `engine_exec` on reported failure, crash, or timeout.
    pub fn wait_complete(&mut self, prompt_id: &str, timeout: Duration) -> Result<Value> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build history client")?;
        let url = self.api_url(&format!("/history/{prompt_id}"));
        let started = Instant::now();
        loop {
            if self.process_died() {
                return Err(core_error(
                    ErrorKind::EngineExec,
                    format!(
                        "engine crashed while executing; last output: {}",
                        self.tail_snapshot()
                    ),
                ));
            }
            if let Ok(response) = client.get(&url).send() {
                if let Ok(history) = response.json::<Value>() {
                    if let Some(entry) = history.get(prompt_id) {
                        let status = entry.get("status").cloned().unwrap_or(Value::Null);
                        match status.get("status_str").and_then(Value::as_str) {
                            Some("success") => {
                                let outputs = entry
                                    .get("outputs")
                                    .cloned()
                                    .or_else(|| status.get("outputs").cloned())
                                    .unwrap_or(Value::Null);
                                return Ok(outputs);
                            }
                            Some("error") => {
                                let message = status
                                    .get("status_message")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown engine error");
                                return Err(core_error(
                                    ErrorKind::EngineExec,
                                    format!("graph failed: {message}"),
                                ));
                            }
                            other => {
                                debug!(status = other.unwrap_or("pending"), "graph still running");
                            }
                        }
                    }
                }
            }
            if started.elapsed() >= timeout {
                self.shutdown();
                return Err(core_error(
                    ErrorKind::EngineExec,
                    format!("graph did not complete within {}s", timeout.as_secs()),
                ));
            }
            std::thread::sleep(EXEC_POLL);
        }
    }

    /// Resolve the files named in an outputs document against the workspace
    /// output directory.
    #[must_use]
    pub fn collect_artifacts(&self, outputs: &Value) -> Vec<Artifact> {
        let mut artifacts = Vec::new();
        match outputs {
            Value::Object(nodes) => {
                for node_output in nodes.values() {
                    collect_from_node(&self.workspace, node_output, &mut artifacts);
                }
            }
            Value::Array(entries) => {
                for entry in entries {
                    if let Value::Object(nodes) = entry {
                        for node_output in nodes.values() {
                            collect_from_node(&self.workspace, node_output, &mut artifacts);
                        }
                    }
                }
            }
            _ => {}
        }
        artifacts
    }

    /// Terminate the engine's process group: TERM, a grace period, then KILL.
    pub fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();
        signal_process_group(pid, "TERM");
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(200));
                }
                _ => {
                    warn!("engine ignored TERM; killing process group");
                    signal_process_group(pid, "KILL");
                    child.kill().ok();
                    child.wait().ok();
                    break;
                }
            }
        }
        for reader in self.readers.drain(..) {
            reader.join().ok();
        }
        debug!("engine stopped");
    }
}

impl Drop for EngineRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Signal the whole group (the engine spawns worker children) via the
/// negative-pid convention.
fn signal_process_group(pid: u32, signal: &str) {
    let _ = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

fn collect_from_node(workspace: &Path, node_output: &Value, artifacts: &mut Vec<Artifact>) {
    let Some(images) = node_output.get("images").and_then(Value::as_array) else {
        return;
    };
    for image in images {
        let Some(filename) = image.get("filename").and_then(Value::as_str) else {
            continue;
        };
        // The engine names plain files; anything else is not ours to read.
        if filename.contains('/') || filename.contains('\\') {
            continue;
        }
        let path = workspace.join("output").join(filename);
        if path.is_file() {
            artifacts.push(Artifact {
                filename: filename.to_string(),
                path,
            });
        } else {
            warn!(%filename, "engine reported an artifact that does not exist");
        }
    }
}
