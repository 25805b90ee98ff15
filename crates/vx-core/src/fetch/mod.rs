//! Multi-scheme content fetcher with checksum verification, atomic
//! publication into the model blob cache, and a bounded retry policy.

mod source;

pub use source::{FetchSource, Transfer};

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use fs4::FileExt;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, warn};

use vx_domain::{Checksum, ChecksumAlgo};

use crate::config::Config;
use crate::errors::{core_error, CoreError, ErrorKind};
use crate::fsx::{fsync_dir, hash_file};
use crate::process::run_command;
use crate::store::{BlobKey, Store};

const USER_AGENT: &str = concat!("vx/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-attempt ceiling for one transfer, body included.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Outcome classification for one transfer attempt.
enum AttemptError {
    /// Worth retrying: connection failures, 5xx, short reads.
    Transient(anyhow::Error),
    /// Retrying cannot help: 4xx, auth, checksum mismatch, local errors.
    Terminal(anyhow::Error),
}

pub struct Fetcher<'a> {
    config: &'a Config,
    store: Store<'a>,
}

impl<'a> Fetcher<'a> {
    #[must_use]
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            store: Store::new(config),
        }
    }

    /// Deliver a local blob path for `uri`, fetching and verifying on a cache
    /// miss. Concurrent calls for the same key collapse onto one download.
    ///
    /// # Errors
    ///
    /// `integrity` on checksum mismatch, `auth` on 401/403, `network` after
    /// the retry budget, `offline_unavailable` when offline with a cold cache.
    pub fn fetch(&self, uri: &str, checksum: Option<&Checksum>) -> Result<PathBuf> {
        let key = checksum
            .map(BlobKey::from_checksum)
            .unwrap_or_else(|| BlobKey::from_uri(uri));
        let blob = self.store.blob_path(&key);
        if blob.is_file() {
            debug!(%uri, blob = %blob.display(), "model cache hit");
            return Ok(blob);
        }
        if self.config.offline {
            return Err(core_error(
                ErrorKind::OfflineUnavailable,
                format!("offline mode has no cached blob for {uri}"),
            ));
        }

        let dir = self.store.blob_dir(&key);
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let _lock = acquire_key_lock(&dir)?;
        // Another process may have published while we waited on the lock.
        if blob.is_file() {
            debug!(%uri, blob = %blob.display(), "model cache hit after lock");
            return Ok(blob);
        }

        let tmp = dir.join(format!(
            "blob.tmp.{}.{:08x}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let result = self.transfer_verified(uri, checksum, &tmp);
        if result.is_err() {
            fs::remove_file(&tmp).ok();
            return result.map(|()| blob);
        }

        fs::rename(&tmp, &blob).with_context(|| {
            format!("failed to publish blob {} -> {}", tmp.display(), blob.display())
        })?;
        fsync_dir(&dir).ok();
        debug!(%uri, blob = %blob.display(), "model blob published");
        Ok(blob)
    }

    /// Fetch `uri` straight to `dest` (no blob cache). Used for per-request
    /// job inputs, which are transient by design.
    ///
    /// # Errors
    ///
    /// Same classification as [`Fetcher::fetch`], minus integrity.
    pub fn fetch_to(&self, uri: &str, dest: &Path) -> Result<()> {
        if self.config.offline {
            return Err(core_error(
                ErrorKind::OfflineUnavailable,
                format!("offline mode cannot fetch request input {uri}"),
            ));
        }
        let parent = dest
            .parent()
            .context("destination must have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let tmp = parent.join(format!(
            ".fetch.tmp.{}.{:08x}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let result = self.transfer_verified(uri, None, &tmp);
        if result.is_err() {
            fs::remove_file(&tmp).ok();
            return result;
        }
        fs::rename(&tmp, dest)
            .with_context(|| format!("failed to move input into {}", dest.display()))?;
        Ok(())
    }

    /// Run the transfer with retries, leaving verified bytes at `tmp`.
    fn transfer_verified(
        &self,
        uri: &str,
        checksum: Option<&Checksum>,
        tmp: &Path,
    ) -> Result<()> {
        let source = FetchSource::parse(uri)?;
        let transfer = source.transfer(self.config)?;

        let attempts = self.config.fetch_attempts.max(1);
        let mut last: Option<anyhow::Error> = None;
        for attempt in 1..=attempts {
            match self.attempt(&transfer, checksum, tmp) {
                Ok(()) => return Ok(()),
                Err(AttemptError::Terminal(err)) => {
                    return Err(err.context(format!("failed to fetch {uri}")))
                }
                Err(AttemptError::Transient(err)) => {
                    fs::remove_file(tmp).ok();
                    if attempt < attempts {
                        let sleep = self.config.fetch_retry_base_sleep
                            * f64::from(2_u32.pow(attempt - 1));
                        warn!(%uri, attempt, "transient fetch failure: {err:#}; retrying in {sleep:.1}s");
                        std::thread::sleep(Duration::from_secs_f64(sleep));
                    }
                    last = Some(err);
                }
            }
        }
        let err = last.unwrap_or_else(|| anyhow::anyhow!("fetch failed"));
        Err(core_error(
            ErrorKind::Network,
            format!("failed to fetch {uri} after {attempts} attempts: {err:#}"),
        ))
    }

    fn attempt(
        &self,
        transfer: &Transfer,
        checksum: Option<&Checksum>,
        tmp: &Path,
    ) -> Result<(), AttemptError> {
        match transfer {
            Transfer::Download { url, headers } => {
                download_streaming(url, headers, checksum, tmp)
            }
            Transfer::Copy { path } => {
                copy_local(path, tmp)?;
                verify_file(tmp, checksum).map_err(AttemptError::Terminal)
            }
            Transfer::VendorCli { bucket, key } => {
                vendor_download(bucket, key, tmp)?;
                verify_file(tmp, checksum).map_err(AttemptError::Terminal)
            }
        }
    }
}

/// Rolling hash used while streaming a download.
enum StreamHasher {
    Sha256(Sha256),
    Sha512(Sha512),
    None,
}

impl StreamHasher {
    fn for_checksum(checksum: Option<&Checksum>) -> Self {
        match checksum.map(|c| c.algo) {
            Some(ChecksumAlgo::Sha256) => Self::Sha256(Sha256::new()),
            Some(ChecksumAlgo::Sha512) => Self::Sha512(Sha512::new()),
            None => Self::None,
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(chunk),
            Self::Sha512(h) => h.update(chunk),
            Self::None => {}
        }
    }

    fn finish(self) -> Option<String> {
        match self {
            Self::Sha256(h) => Some(hex::encode(h.finalize())),
            Self::Sha512(h) => Some(hex::encode(h.finalize())),
            Self::None => None,
        }
    }
}

fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(ATTEMPT_TIMEOUT)
        .build()
        .context("failed to build http client")
}

fn download_streaming(
    url: &str,
    headers: &[(String, String)],
    checksum: Option<&Checksum>,
    tmp: &Path,
) -> Result<(), AttemptError> {
    let client = http_client().map_err(AttemptError::Terminal)?;
    let mut request = client.get(url);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    let mut response = request
        .send()
        .map_err(|err| AttemptError::Transient(anyhow::Error::from(err).context("request failed")))?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        let hint = if headers.is_empty() {
            " (no auth token configured)"
        } else {
            ""
        };
        return Err(AttemptError::Terminal(
            CoreError::new(
                ErrorKind::Auth,
                format!("{status} from {url}{hint}"),
            )
            .into(),
        ));
    }
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return Err(AttemptError::Transient(anyhow::anyhow!(
            "{status} from {url}"
        )));
    }
    if !status.is_success() {
        return Err(AttemptError::Terminal(
            CoreError::new(ErrorKind::Network, format!("{status} from {url}")).into(),
        ));
    }

    let mut file = File::create(tmp)
        .with_context(|| format!("failed to create {}", tmp.display()))
        .map_err(AttemptError::Terminal)?;
    let mut hasher = StreamHasher::for_checksum(checksum);
    let mut buffer = vec![0_u8; 64 * 1024];
    loop {
        let read = match response.read(&mut buffer) {
            Ok(read) => read,
            Err(err) => {
                return Err(AttemptError::Transient(
                    anyhow::Error::from(err).context(format!("stream error for {url}")),
                ))
            }
        };
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        file.write_all(&buffer[..read])
            .with_context(|| format!("failed to write {}", tmp.display()))
            .map_err(AttemptError::Terminal)?;
    }

    if let (Some(expected), Some(actual)) = (checksum, hasher.finish()) {
        if actual != expected.hex {
            return Err(AttemptError::Terminal(
                CoreError::new(
                    ErrorKind::Integrity,
                    format!(
                        "checksum mismatch for {url}: expected {expected}, got {}:{actual}",
                        expected.algo.as_str()
                    ),
                )
                .into(),
            ));
        }
    }
    file.sync_all()
        .with_context(|| format!("failed to flush {}", tmp.display()))
        .map_err(AttemptError::Terminal)?;
    Ok(())
}

fn copy_local(path: &Path, tmp: &Path) -> Result<(), AttemptError> {
    if !path.is_file() {
        return Err(AttemptError::Terminal(core_error(
            ErrorKind::Network,
            format!("local source not found: {}", path.display()),
        )));
    }
    fs::copy(path, tmp)
        .with_context(|| format!("failed to copy {}", path.display()))
        .map_err(AttemptError::Terminal)?;
    Ok(())
}

fn vendor_download(bucket: &str, key: &str, tmp: &Path) -> Result<(), AttemptError> {
    let uri = format!("gs://{bucket}/{key}");
    let output = run_command(
        "gsutil",
        &[
            "-q".to_string(),
            "cp".to_string(),
            uri.clone(),
            tmp.display().to_string(),
        ],
        &[],
        None,
    )
    .map_err(AttemptError::Terminal)?;
    if output.success() {
        return Ok(());
    }
    let detail = output.failure_detail().to_string();
    if detail.contains("403") || detail.contains("AccessDenied") || detail.contains("401") {
        return Err(AttemptError::Terminal(core_error(
            ErrorKind::Auth,
            format!("access denied for {uri}: {detail}"),
        )));
    }
    if detail.contains("404") || detail.contains("No URLs matched") {
        return Err(AttemptError::Terminal(core_error(
            ErrorKind::Network,
            format!("object not found: {uri}"),
        )));
    }
    Err(AttemptError::Transient(anyhow::anyhow!(
        "gsutil cp {uri} failed ({}): {detail}",
        output.code
    )))
}

/// Verify a fully written temp file against a declared checksum.
fn verify_file(tmp: &Path, checksum: Option<&Checksum>) -> Result<()> {
    let Some(expected) = checksum else {
        return sync_file(tmp);
    };
    let actual = hash_file(tmp, expected.algo)?;
    if actual != expected.hex {
        return Err(core_error(
            ErrorKind::Integrity,
            format!(
                "checksum mismatch: expected {expected}, got {}:{actual}",
                expected.algo.as_str()
            ),
        ));
    }
    sync_file(tmp)
}

fn sync_file(path: &Path) -> Result<()> {
    File::open(path)
        .and_then(|f| f.sync_all())
        .with_context(|| format!("failed to flush {}", path.display()))
}

/// Per-key exclusive lock; blocks until any concurrent fetch of the same key
/// completes. A file lock (not an in-process mutex) because multiple worker
/// processes share the cache.
fn acquire_key_lock(dir: &Path) -> Result<File> {
    let path = dir.join(".lock");
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .with_context(|| format!("failed to open fetch lock {}", path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("failed to lock {}", path.display()))?;
    Ok(file)
}
