use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Immutable view of the process environment, captured once at startup.
#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str).filter(|v| !v.trim().is_empty())
    }

    pub(crate) fn flag(&self, key: &str) -> bool {
        self.var(key)
            .map(|raw| {
                let value = raw.trim().to_ascii_lowercase();
                matches!(value.as_str(), "1" | "true" | "yes" | "on")
            })
            .unwrap_or(false)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.var(key).and_then(|raw| raw.trim().parse().ok())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        Self {
            vars: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }
}

/// Object-storage uploader settings, all environment-driven.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub bucket: Option<String>,
    pub prefix: String,
    pub public: bool,
    pub signed_url_ttl: u64,
    pub retries: u32,
    pub retry_base_sleep: f64,
    pub validate: bool,
}

/// One configuration struct materialized at startup; every component receives
/// it by reference. No globals.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the shared caches: `sources/`, `models/`, `resolved/`.
    pub cache_root: PathBuf,
    /// Explicit workspace root override (`ENGINE_HOME`).
    pub engine_home: Option<PathBuf>,
    /// Explicit models directory override (`MODELS_DIR`).
    pub models_dir: Option<PathBuf>,
    /// Directory holding `versions/<id>.json` spec files.
    pub specs_root: PathBuf,
    pub offline: bool,
    pub output_mode: String,
    pub hub_token: Option<String>,
    pub market_token: Option<String>,
    pub hub_base_url: String,
    pub market_base_url: String,
    pub fetch_attempts: u32,
    pub fetch_retry_base_sleep: f64,
    pub object_store: ObjectStoreConfig,
}

const DEFAULT_HUB_BASE: &str = "https://huggingface.co";
const DEFAULT_MARKET_BASE: &str = "https://civitai.com";

/// Persistent volumes probed for a default cache/workspace root, in order.
const VOLUME_CANDIDATES: &[&str] = &["/volume", "/workspace"];

impl Config {
    /// Build the configuration from the current process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Self {
        let cache_root = snapshot
            .var("CACHE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_root);
        Self {
            cache_root,
            engine_home: snapshot.var("ENGINE_HOME").map(PathBuf::from),
            models_dir: snapshot.var("MODELS_DIR").map(PathBuf::from),
            specs_root: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            offline: snapshot.flag("OFFLINE"),
            output_mode: snapshot
                .var("OUTPUT_MODE")
                .unwrap_or("object")
                .to_string(),
            hub_token: snapshot.var("HUB_TOKEN").map(ToOwned::to_owned),
            market_token: snapshot.var("MARKET_TOKEN").map(ToOwned::to_owned),
            hub_base_url: snapshot
                .var("HUB_BASE_URL")
                .unwrap_or(DEFAULT_HUB_BASE)
                .trim_end_matches('/')
                .to_string(),
            market_base_url: snapshot
                .var("MARKET_BASE_URL")
                .unwrap_or(DEFAULT_MARKET_BASE)
                .trim_end_matches('/')
                .to_string(),
            fetch_attempts: 3,
            fetch_retry_base_sleep: 0.5,
            object_store: ObjectStoreConfig {
                bucket: snapshot.var("OBJECT_BUCKET").map(ToOwned::to_owned),
                prefix: snapshot
                    .var("OBJECT_PREFIX")
                    .unwrap_or("engine/outputs")
                    .to_string(),
                public: snapshot.flag("OBJECT_PUBLIC"),
                signed_url_ttl: snapshot.parse("OBJECT_SIGNED_URL_TTL").unwrap_or(0),
                retries: snapshot.parse("OBJECT_RETRIES").unwrap_or(3),
                retry_base_sleep: snapshot.parse("OBJECT_RETRY_BASE_SLEEP").unwrap_or(0.5),
                validate: snapshot
                    .var("OBJECT_VALIDATE")
                    .map(|_| snapshot.flag("OBJECT_VALIDATE"))
                    .unwrap_or(true),
            },
        }
    }

    #[must_use]
    pub fn sources_dir(&self) -> PathBuf {
        self.cache_root.join("sources")
    }

    #[must_use]
    pub fn models_cache_dir(&self) -> PathBuf {
        self.cache_root.join("models")
    }

    #[must_use]
    pub fn resolved_dir(&self) -> PathBuf {
        self.cache_root.join("resolved")
    }

    /// Workspace directory for a version: `ENGINE_HOME` when set, else
    /// `<volume>/vx-<id>` on a persistent volume, else `$HOME/vx-<id>`,
    /// else `./vx-<id>`.
    #[must_use]
    pub fn workspace_for(&self, version_id: &str) -> PathBuf {
        if let Some(home) = &self.engine_home {
            return home.clone();
        }
        let leaf = format!("vx-{version_id}");
        if let Some(volume) = writable_volume() {
            return volume.join(leaf);
        }
        if let Some(home) = dirs_next::home_dir() {
            return home.join(leaf);
        }
        PathBuf::from(".").join(leaf)
    }

    /// Models directory for a workspace, honoring `MODELS_DIR`.
    #[must_use]
    pub fn models_dir_for(&self, workspace: &Path) -> PathBuf {
        self.models_dir
            .clone()
            .unwrap_or_else(|| workspace.join("models"))
    }
}

fn writable_volume() -> Option<PathBuf> {
    VOLUME_CANDIDATES.iter().map(|p| PathBuf::from(*p)).find(|path| {
        path.is_dir()
            && path
                .metadata()
                .map(|meta| !meta.permissions().readonly())
                .unwrap_or(false)
    })
}

fn default_cache_root() -> PathBuf {
    if let Some(volume) = writable_volume() {
        return volume.join("cache").join("vx");
    }
    if let Some(xdg) = env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("vx");
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join("vx")
}

/// Expand `${VAR}` and `$VAR` references from the process environment.
///
/// Unknown variables expand to the empty string, matching how the engine's
/// own path expansion behaves.
#[must_use]
pub fn expand_env_refs(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.char_indices().peekable();
    while let Some((_, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        let braced = matches!(chars.peek(), Some((_, '{')));
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some((_, next)) = chars.peek().copied() {
            let valid = next.is_ascii_alphanumeric() || next == '_';
            if braced && next == '}' {
                chars.next();
                break;
            }
            if !valid {
                break;
            }
            name.push(next);
            chars.next();
        }
        if name.is_empty() {
            out.push('$');
            if braced {
                out.push('{');
            }
        } else {
            out.push_str(&env::var(&name).unwrap_or_default());
        }
    }
    out
}
