use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{debug, warn};

use crate::fetch::Fetcher;

/// Per-request staging state: which logical input names map to which
/// materialized files under `<workspace>/input/`.
///
/// Materialized names are prefixed with the request id plus a random token so
/// concurrent jobs sharing a workspace can both stage an `img.png` without
/// touching each other's files.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub input_dir: PathBuf,
    staged: BTreeMap<String, String>,
}

impl RequestContext {
    #[must_use]
    pub fn new(request_id: impl Into<String>, workspace: &Path) -> Self {
        Self {
            request_id: request_id.into(),
            input_dir: workspace.join("input"),
            staged: BTreeMap::new(),
        }
    }

    /// `logical name -> materialized file name` for the graph rewrite.
    #[must_use]
    pub fn staged_inputs(&self) -> &BTreeMap<String, String> {
        &self.staged
    }

    /// Fetch every declared input into the workspace under a request-unique
    /// name.
    ///
    /// # Errors
    ///
    /// Propagates fetch failures; already staged files stay on disk for
    /// [`RequestContext::cleanup`] to collect.
    pub fn stage_inputs(
        &mut self,
        fetcher: &Fetcher<'_>,
        inputs: &BTreeMap<String, String>,
    ) -> Result<()> {
        fs::create_dir_all(&self.input_dir)
            .with_context(|| format!("failed to create {}", self.input_dir.display()))?;
        for (logical, url) in inputs {
            let token: u32 = rand::thread_rng().gen();
            let materialized = format!(
                "{}_{:08x}_{}",
                self.request_id,
                token,
                sanitize_name(logical)
            );
            let dest = self.input_dir.join(&materialized);
            fetcher
                .fetch_to(url, &dest)
                .with_context(|| format!("failed to stage input '{logical}'"))?;
            debug!(%logical, %materialized, "staged request input");
            self.staged.insert(logical.clone(), materialized);
        }
        Ok(())
    }

    /// Delete exactly this request's staged files: everything in the input
    /// directory whose name starts with our request id, and nothing else.
    pub fn cleanup(&self) {
        let prefix = format!("{}_", self.request_id);
        let entries = match fs::read_dir(&self.input_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) {
                if let Err(err) = fs::remove_file(entry.path()) {
                    warn!(file = name, "failed to remove staged input: {err}");
                }
            }
        }
    }
}

/// Reduce a logical input name to a plain file name; path components would
/// otherwise let a graph reference escape the input directory.
fn sanitize_name(logical: &str) -> String {
    let base = logical
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(logical)
        .trim_matches(['.', ' ']);
    if base.is_empty() {
        "input".to_string()
    } else {
        base.to_string()
    }
}

/// Generate a request id for locally triggered jobs (the serverless platform
/// supplies its own for queued ones).
#[must_use]
pub fn local_request_id() -> String {
    let token: u64 = rand::thread_rng().gen();
    format!("local-{token:016x}")
}
