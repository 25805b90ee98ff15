use serde::Serialize;

use vx_domain::{PathSafetyError, SpecError};

/// Stable failure tokens, usable in logs, CLI output, and machine responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Usage,
    Validation,
    OfflineUnavailable,
    Network,
    Integrity,
    Auth,
    Realization,
    EnvBuild,
    EngineStart,
    EngineExec,
    Upload,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::Validation => "validation",
            Self::OfflineUnavailable => "offline_unavailable",
            Self::Network => "network",
            Self::Integrity => "integrity",
            Self::Auth => "auth",
            Self::Realization => "realization",
            Self::EnvBuild => "env_build",
            Self::EngineStart => "engine_start",
            Self::EngineExec => "engine_exec",
            Self::Upload => "upload",
            Self::Internal => "internal",
        }
    }

    /// Process exit code for the CLI boundary.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Usage => 2,
            Self::Validation => 3,
            Self::Realization | Self::EnvBuild => 4,
            Self::EngineStart | Self::EngineExec | Self::Upload => 5,
            Self::Integrity => 6,
            Self::OfflineUnavailable => 7,
            Self::Network | Self::Auth | Self::Internal => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// A classified failure. Components raise these through `anyhow` so the
/// boundary (CLI or job handler) can recover the kind from the chain.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CoreError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Shorthand constructor returning `anyhow::Error` directly.
pub fn core_error(kind: ErrorKind, message: impl Into<String>) -> anyhow::Error {
    CoreError::new(kind, message).into()
}

/// Walk an error chain and recover the most specific [`ErrorKind`].
///
/// Spec validation and path-safety failures classify as `validation` even
/// when surfaced through plain `anyhow` context wrapping.
#[must_use]
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(core) = cause.downcast_ref::<CoreError>() {
            return core.kind;
        }
        if cause.downcast_ref::<SpecError>().is_some()
            || cause.downcast_ref::<PathSafetyError>().is_some()
        {
            return ErrorKind::Validation;
        }
    }
    ErrorKind::Internal
}
