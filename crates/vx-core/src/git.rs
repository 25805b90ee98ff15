use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use vx_domain::normalize_commit;

use crate::config::Config;
use crate::errors::{core_error, ErrorKind};
use crate::fsx::{fsync_dir, sha256_hex};
use crate::process::run_command;

/// How long a waiter tolerates another process's in-flight clone before
/// giving up. Clones of large engine repos can legitimately take minutes.
const CLONE_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Resolves refs to commits and materializes commit-pinned checkouts into the
/// shared source cache at `$CACHE_ROOT/sources/<slug>@<commit>`.
pub struct GitResolver<'a> {
    config: &'a Config,
}

impl<'a> GitResolver<'a> {
    #[must_use]
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Look up the commit hash of `ref` without cloning.
    ///
    /// A value that is already a full commit hash is accepted verbatim (and
    /// lowercased); this is what keeps resolution idempotent and offline-safe
    /// for pinned specs.
    ///
    /// # Errors
    ///
    /// `offline_unavailable` when offline and the ref is not a pinned commit;
    /// `network` when `git ls-remote` fails or returns nothing usable.
    pub fn resolve(&self, repo: &str, git_ref: Option<&str>) -> Result<String> {
        if let Some(candidate) = git_ref {
            if let Ok(commit) = normalize_commit(candidate) {
                return Ok(commit);
            }
        }
        if self.config.offline {
            return Err(core_error(
                ErrorKind::OfflineUnavailable,
                format!(
                    "offline mode cannot resolve ref {:?} for {repo}; pin a commit instead",
                    git_ref.unwrap_or("HEAD")
                ),
            ));
        }

        let ref_to_use = git_ref.unwrap_or("HEAD");
        let output = run_command(
            "git",
            &[
                "ls-remote".to_string(),
                repo.to_string(),
                ref_to_use.to_string(),
            ],
            &[],
            None,
        )?;
        if !output.success() {
            return Err(core_error(
                ErrorKind::Network,
                format!(
                    "git ls-remote {repo} {ref_to_use} failed ({}): {}",
                    output.code,
                    output.failure_detail()
                ),
            ));
        }

        // Annotated tags list both the tag object and the peeled commit
        // (`refs/tags/x^{}`); the peeled line is the one callers want.
        let mut first: Option<String> = None;
        for line in output.stdout.lines() {
            let mut parts = line.split('\t');
            let (Some(sha), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(commit) = normalize_commit(sha) else {
                continue;
            };
            if name.ends_with("^{}") {
                return Ok(commit);
            }
            if first.is_none() {
                first = Some(commit);
            }
        }
        first.ok_or_else(|| {
            core_error(
                ErrorKind::Network,
                format!("no commit found for {repo} {ref_to_use}"),
            )
        })
    }

    /// Ensure a clean checkout of `commit` exists in the source cache and
    /// return its path. Idempotent; safe across processes.
    ///
    /// # Errors
    ///
    /// `offline_unavailable` when offline and the entry is absent; `network`
    /// when the fetch fails.
    pub fn materialize(&self, repo: &str, commit: &str) -> Result<PathBuf> {
        let commit = normalize_commit(commit).map_err(|bad| {
            core_error(ErrorKind::Validation, format!("invalid commit '{bad}'"))
        })?;
        let entry = self.entry_path(repo, &commit);
        if entry.is_dir() {
            debug!(entry = %entry.display(), "source cache hit");
            return Ok(entry);
        }
        if self.config.offline {
            return Err(core_error(
                ErrorKind::OfflineUnavailable,
                format!(
                    "offline mode requires a cached checkout of {repo}@{commit} at {}",
                    entry.display()
                ),
            ));
        }

        let sources = self.config.sources_dir();
        fs::create_dir_all(&sources)
            .with_context(|| format!("failed to create {}", sources.display()))?;

        let sentinel = sentinel_path(&entry);
        loop {
            if entry.is_dir() {
                return Ok(entry);
            }
            match OpenOptions::new().write(true).create_new(true).open(&sentinel) {
                Ok(_) => break,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    wait_for_clone(&entry, &sentinel)?;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to create clone sentinel {}", sentinel.display())
                    })
                }
            }
        }

        let result = self.clone_into(repo, &commit, &entry);
        fs::remove_file(&sentinel).ok();
        if result.is_err() {
            // Leave no partial entry behind; the next caller starts clean.
            fs::remove_dir_all(&entry).ok();
        }
        result.map(|()| entry)
    }

    fn clone_into(&self, repo: &str, commit: &str, entry: &Path) -> Result<()> {
        let sources = self.config.sources_dir();
        let staging = tempfile::Builder::new()
            .prefix(".clone-")
            .tempdir_in(&sources)
            .context("failed to create staging directory for clone")?;
        let checkout = staging.path().join("repo");
        fs::create_dir_all(&checkout)?;
        debug!(%repo, %commit, "cloning into source cache");

        git_in(&checkout, &["init", "--quiet"], repo, commit)?;
        let shallow = run_git(
            &checkout,
            &["fetch", "--quiet", "--depth", "1", repo, commit],
        )?;
        if !shallow.success() {
            // Some servers refuse direct commit fetches; fall back to a full
            // fetch of the default refs.
            warn!(%repo, %commit, "shallow fetch refused, retrying with a full fetch");
            let full = run_git(&checkout, &["fetch", "--quiet", "--tags", repo])?;
            if !full.success() {
                return Err(core_error(
                    ErrorKind::Network,
                    format!(
                        "git fetch {repo} failed ({}): {}",
                        full.code,
                        full.failure_detail()
                    ),
                ));
            }
        }
        git_in(
            &checkout,
            &["checkout", "--quiet", "--detach", commit],
            repo,
            commit,
        )?;

        fs::rename(&checkout, entry).with_context(|| {
            format!(
                "failed to publish source cache entry {} -> {}",
                checkout.display(),
                entry.display()
            )
        })?;
        fsync_dir(&sources).ok();
        debug!(entry = %entry.display(), "source cache entry published");
        Ok(())
    }

    fn entry_path(&self, repo: &str, commit: &str) -> PathBuf {
        self.config
            .sources_dir()
            .join(format!("{}@{commit}", repo_slug(repo)))
    }
}

fn run_git(cwd: &Path, args: &[&str]) -> Result<crate::process::RunOutput> {
    let args: Vec<String> = args.iter().map(ToString::to_string).collect();
    run_command("git", &args, &[], Some(cwd))
}

fn git_in(cwd: &Path, args: &[&str], repo: &str, commit: &str) -> Result<()> {
    let output = run_git(cwd, args)?;
    if output.success() {
        Ok(())
    } else {
        Err(core_error(
            ErrorKind::Network,
            format!(
                "git {} failed for {repo}@{commit} ({}): {}",
                args.first().copied().unwrap_or("?"),
                output.code,
                output.failure_detail()
            ),
        ))
    }
}

fn sentinel_path(entry: &Path) -> PathBuf {
    let mut name = entry
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".cloning");
    entry.with_file_name(name)
}

fn wait_for_clone(entry: &Path, sentinel: &Path) -> Result<()> {
    let started = Instant::now();
    let mut sleep = Duration::from_millis(100);
    loop {
        if entry.is_dir() || !sentinel.exists() {
            return Ok(());
        }
        if started.elapsed() > CLONE_WAIT_TIMEOUT {
            return Err(core_error(
                ErrorKind::Network,
                format!(
                    "timed out waiting for a concurrent clone of {}",
                    entry.display()
                ),
            ));
        }
        std::thread::sleep(sleep);
        sleep = (sleep * 2).min(Duration::from_secs(5));
    }
}

/// Cache slug for a repository URL: last path segment (minus `.git`) plus a
/// short hash of the full URL so forks with the same name stay distinct.
#[must_use]
pub fn repo_slug(repo: &str) -> String {
    let tail = repo
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git");
    let tail: String = tail
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let tail = if tail.is_empty() {
        "repo".to_string()
    } else {
        tail
    };
    format!("{tail}-{}", &sha256_hex(repo.as_bytes())[..8])
}

/// Default extension name: last URL path segment stripped of `.git`.
#[must_use]
pub fn repo_short_name(repo: &str) -> String {
    let tail = repo
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git");
    if tail.is_empty() {
        "repo".to_string()
    } else {
        tail.to_string()
    }
}
