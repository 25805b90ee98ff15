use std::path::PathBuf;

use anyhow::Result;
use url::Url;

use crate::config::Config;
use crate::errors::{core_error, ErrorKind};

/// A parsed fetch source, one arm per supported scheme. New schemes are added
/// by extending the variant and the match in [`FetchSource::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSource {
    Http {
        url: String,
    },
    LocalFile {
        path: PathBuf,
    },
    ObjectStore {
        bucket: String,
        key: String,
    },
    Hub {
        org: String,
        repo: String,
        revision: String,
        path: String,
    },
    /// Marketplace download path, normalized to `api/download/models/<id>`
    /// with any format-hint query preserved.
    Market {
        api_path: String,
    },
}

/// How to actually move the bytes for a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Download {
        url: String,
        headers: Vec<(String, String)>,
    },
    Copy {
        path: PathBuf,
    },
    VendorCli {
        bucket: String,
        key: String,
    },
}

impl FetchSource {
    /// Parse a source URI. Bare paths and `file://` URIs are local copies.
    ///
    /// # Errors
    ///
    /// Returns a `validation` error for malformed or unsupported URIs.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(core_error(ErrorKind::Validation, "empty model source"));
        }
        if let Some(rest) = uri.strip_prefix("http://") {
            return nonempty(rest, uri).map(|_| Self::Http {
                url: uri.to_string(),
            });
        }
        if let Some(rest) = uri.strip_prefix("https://") {
            return nonempty(rest, uri).map(|_| Self::Http {
                url: uri.to_string(),
            });
        }
        if let Some(rest) = uri.strip_prefix("file://") {
            return nonempty(rest, uri).map(|_| Self::LocalFile {
                path: PathBuf::from(rest),
            });
        }
        if let Some(rest) = uri.strip_prefix("gs://") {
            let (bucket, key) = rest.split_once('/').ok_or_else(|| bad_uri(uri))?;
            if bucket.is_empty() || key.is_empty() {
                return Err(bad_uri(uri));
            }
            return Ok(Self::ObjectStore {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if let Some(rest) = uri.strip_prefix("hub://") {
            return parse_hub(rest, uri);
        }
        if let Some(rest) = uri.strip_prefix("market://") {
            return parse_market(rest, uri);
        }
        if uri.contains("://") {
            return Err(core_error(
                ErrorKind::Validation,
                format!("unsupported source scheme: {uri}"),
            ));
        }
        Ok(Self::LocalFile {
            path: PathBuf::from(uri),
        })
    }

    /// Resolve this source into a transfer plan, attaching auth headers from
    /// the configured tokens.
    ///
    /// # Errors
    ///
    /// Returns an error when a final URL cannot be composed.
    pub fn transfer(&self, config: &Config) -> Result<Transfer> {
        match self {
            Self::Http { url } => Ok(Transfer::Download {
                url: url.clone(),
                headers: Vec::new(),
            }),
            Self::LocalFile { path } => Ok(Transfer::Copy { path: path.clone() }),
            Self::ObjectStore { bucket, key } => Ok(Transfer::VendorCli {
                bucket: bucket.clone(),
                key: key.clone(),
            }),
            Self::Hub {
                org,
                repo,
                revision,
                path,
            } => {
                let mut url = Url::parse(&config.hub_base_url).map_err(|err| {
                    core_error(
                        ErrorKind::Validation,
                        format!("invalid hub base url {}: {err}", config.hub_base_url),
                    )
                })?;
                url.path_segments_mut()
                    .map_err(|()| {
                        core_error(
                            ErrorKind::Validation,
                            format!("hub base url cannot carry paths: {}", config.hub_base_url),
                        )
                    })?
                    .push(org)
                    .push(repo)
                    .push("resolve")
                    .push(revision)
                    .extend(path.split('/'));
                url.set_query(Some("download=true"));
                let mut headers = Vec::new();
                if let Some(token) = &config.hub_token {
                    headers.push(("Authorization".to_string(), format!("Bearer {token}")));
                }
                Ok(Transfer::Download {
                    url: url.to_string(),
                    headers,
                })
            }
            Self::Market { api_path } => {
                let url = format!("{}/{api_path}", config.market_base_url);
                let mut headers = Vec::new();
                if let Some(token) = &config.market_token {
                    headers.push(("Authorization".to_string(), format!("Bearer {token}")));
                }
                Ok(Transfer::Download { url, headers })
            }
        }
    }
}

fn nonempty(rest: &str, uri: &str) -> Result<()> {
    if rest.trim().is_empty() {
        Err(bad_uri(uri))
    } else {
        Ok(())
    }
}

fn bad_uri(uri: &str) -> anyhow::Error {
    core_error(ErrorKind::Validation, format!("malformed source URI: {uri}"))
}

/// `hub://<org>/<repo>[@<rev>]/<path>` or the long alias
/// `hub://<org>/<repo>/<path>?rev=<rev>`. Revision defaults to `main`.
fn parse_hub(rest: &str, uri: &str) -> Result<FetchSource> {
    let (path_part, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    let mut segments = path_part.split('/').filter(|s| !s.is_empty());
    let org = segments.next().ok_or_else(|| bad_uri(uri))?;
    let repo_segment = segments.next().ok_or_else(|| bad_uri(uri))?;
    let file_path: Vec<&str> = segments.collect();
    if file_path.is_empty() {
        return Err(core_error(
            ErrorKind::Validation,
            format!("hub source must name a file inside the repository: {uri}"),
        ));
    }

    let (repo, mut revision) = match repo_segment.split_once('@') {
        Some((repo, rev)) if !rev.is_empty() => (repo, Some(rev.to_string())),
        Some((repo, _)) => (repo, None),
        None => (repo_segment, None),
    };
    if revision.is_none() {
        if let Some(query) = query {
            for pair in query.split('&') {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                if matches!(key, "rev" | "revision") && !value.is_empty() {
                    revision = Some(value.to_string());
                    break;
                }
            }
        }
    }
    if org.is_empty() || repo.is_empty() {
        return Err(bad_uri(uri));
    }
    Ok(FetchSource::Hub {
        org: org.to_string(),
        repo: repo.to_string(),
        revision: revision.unwrap_or_else(|| "main".to_string()),
        path: file_path.join("/"),
    })
}

/// `market://models/<id>` or `market://api/download/models/<id>`; a query
/// string (format/type hints) rides along untouched.
fn parse_market(rest: &str, uri: &str) -> Result<FetchSource> {
    let (path_part, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    let trimmed = path_part.trim_matches('/');
    let api_path = if let Some(id) = trimmed.strip_prefix("api/download/models/") {
        nonempty(id, uri)?;
        format!("api/download/models/{id}")
    } else if let Some(id) = trimmed.strip_prefix("models/") {
        nonempty(id, uri)?;
        if id.contains('/') {
            return Err(bad_uri(uri));
        }
        format!("api/download/models/{id}")
    } else {
        return Err(core_error(
            ErrorKind::Validation,
            format!(
                "market source must be market://models/<id> or market://api/download/models/<id>: {uri}"
            ),
        ));
    };
    Ok(FetchSource::Market {
        api_path: match query {
            Some(query) if !query.is_empty() => format!("{api_path}?{query}"),
            _ => api_path,
        },
    })
}
