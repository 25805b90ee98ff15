//! Object-storage delivery: the fetcher's inverse. Uploads ride the same
//! vendor CLI as `gs://` fetches and obey the same exponential-backoff retry
//! shape, configured through the `OBJECT_*` environment variables.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde::Serialize;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::ObjectStoreConfig;
use crate::errors::{core_error, ErrorKind};
use crate::process::run_command;

const OBJECT_TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");

/// Result of a completed upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub object_url: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_url: Option<String>,
}

pub struct Uploader<'a> {
    config: &'a ObjectStoreConfig,
}

impl<'a> Uploader<'a> {
    #[must_use]
    pub fn new(config: &'a ObjectStoreConfig) -> Self {
        Self { config }
    }

    /// Upload one artifact file; the object key is
    /// `<prefix>/<request_id>_<timestamp>-<token>.<ext>`.
    ///
    /// # Errors
    ///
    /// `upload` when no bucket is configured, validation fails, or the
    /// transfer keeps failing after the retry budget.
    pub fn upload(
        &self,
        artifact: &Path,
        request_id: &str,
        extension: &str,
    ) -> Result<UploadResult> {
        let bucket = self.config.bucket.as_deref().ok_or_else(|| {
            core_error(
                ErrorKind::Upload,
                "object output requires a bucket (object_bucket or OBJECT_BUCKET)",
            )
        })?;
        let size = std::fs::metadata(artifact)
            .map_err(|err| {
                core_error(
                    ErrorKind::Upload,
                    format!("artifact vanished before upload: {err}"),
                )
            })?
            .len();

        if self.config.validate {
            self.validate_bucket(bucket)?;
        }

        let key = self.object_key(request_id, extension);
        let object_url = format!("gs://{bucket}/{key}");
        self.copy_with_retries(artifact, &object_url)?;
        info!(%object_url, size, "artifact uploaded");

        if self.config.public {
            self.grant_public_read(&object_url);
        }
        let signed_url = if self.config.signed_url_ttl > 0 {
            self.sign_url(&object_url)
        } else {
            None
        };

        Ok(UploadResult {
            object_url,
            size,
            signed_url,
        })
    }

    fn object_key(&self, request_id: &str, extension: &str) -> String {
        let timestamp = OffsetDateTime::now_utc()
            .format(OBJECT_TIMESTAMP)
            .unwrap_or_else(|_| "00000000T000000Z".to_string());
        let token: u32 = rand::thread_rng().gen();
        let prefix = self.config.prefix.trim_matches('/');
        let extension = extension.trim_start_matches('.');
        format!("{prefix}/{request_id}_{timestamp}-{token:08x}.{extension}")
    }

    fn validate_bucket(&self, bucket: &str) -> Result<()> {
        let output = run_command(
            "gsutil",
            &["ls".to_string(), "-b".to_string(), format!("gs://{bucket}")],
            &[],
            None,
        )
        .map_err(|err| core_error(ErrorKind::Upload, format!("{err:#}")))?;
        if output.success() {
            Ok(())
        } else {
            Err(core_error(
                ErrorKind::Upload,
                format!(
                    "bucket validation failed for gs://{bucket}: {}",
                    output.failure_detail()
                ),
            ))
        }
    }

    fn copy_with_retries(&self, artifact: &Path, object_url: &str) -> Result<()> {
        let attempts = self.config.retries.max(1);
        let mut last_detail = String::new();
        for attempt in 1..=attempts {
            let output = run_command(
                "gsutil",
                &[
                    "-q".to_string(),
                    "cp".to_string(),
                    artifact.display().to_string(),
                    object_url.to_string(),
                ],
                &[],
                None,
            )
            .map_err(|err| core_error(ErrorKind::Upload, format!("{err:#}")))?;
            if output.success() {
                return Ok(());
            }
            last_detail = output.failure_detail().to_string();
            if attempt < attempts {
                let sleep = self.config.retry_base_sleep * f64::from(2_u32.pow(attempt - 1));
                warn!(attempt, "upload attempt failed: {last_detail}; retrying in {sleep:.1}s");
                std::thread::sleep(Duration::from_secs_f64(sleep));
            }
        }
        Err(core_error(
            ErrorKind::Upload,
            format!("upload failed after {attempts} attempts: {last_detail}"),
        ))
    }

    /// Best effort; a missing ACL is logged, never fatal.
    fn grant_public_read(&self, object_url: &str) {
        let output = run_command(
            "gsutil",
            &[
                "acl".to_string(),
                "ch".to_string(),
                "-u".to_string(),
                "AllUsers:R".to_string(),
                object_url.to_string(),
            ],
            &[],
            None,
        );
        match output {
            Ok(result) if result.success() => debug!(%object_url, "public-read ACL granted"),
            Ok(result) => warn!("failed to set public-read ACL: {}", result.failure_detail()),
            Err(err) => warn!("failed to set public-read ACL: {err:#}"),
        }
    }

    /// Best effort; signing needs service-account credentials that may be
    /// absent on the worker.
    fn sign_url(&self, object_url: &str) -> Option<String> {
        let output = run_command(
            "gsutil",
            &[
                "signurl".to_string(),
                "-d".to_string(),
                format!("{}s", self.config.signed_url_ttl),
                "-u".to_string(),
                object_url.to_string(),
            ],
            &[],
            None,
        )
        .ok()?;
        if !output.success() {
            warn!("failed to sign URL: {}", output.failure_detail());
            return None;
        }
        // Last whitespace-separated token of the last line is the URL.
        output
            .stdout
            .lines()
            .last()
            .and_then(|line| line.split_whitespace().last())
            .filter(|token| token.starts_with("https://"))
            .map(ToOwned::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ObjectStoreConfig {
        ObjectStoreConfig {
            bucket: Some("artifacts".to_string()),
            prefix: "/engine/outputs/".to_string(),
            public: false,
            signed_url_ttl: 0,
            retries: 3,
            retry_base_sleep: 0.5,
            validate: false,
        }
    }

    #[test]
    fn object_keys_carry_request_id_timestamp_and_extension() {
        let config = config();
        let uploader = Uploader::new(&config);
        let key = uploader.object_key("req-42", ".png");
        assert!(key.starts_with("engine/outputs/req-42_"));
        assert!(key.ends_with(".png"));
        assert!(key.contains('T'));
        // Two keys for the same request never collide.
        assert_ne!(key, uploader.object_key("req-42", ".png"));
    }

    #[test]
    fn missing_bucket_is_an_upload_error() {
        let mut config = config();
        config.bucket = None;
        let uploader = Uploader::new(&config);
        let temp = tempfile::tempdir().expect("tempdir");
        let artifact = temp.path().join("a.png");
        std::fs::write(&artifact, b"png").expect("artifact");
        let err = uploader.upload(&artifact, "req", "png").expect_err("no bucket");
        assert_eq!(crate::errors::classify(&err), ErrorKind::Upload);
    }
}
