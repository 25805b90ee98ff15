use std::path::{Component, Path, PathBuf};

/// Rejection reasons for model target paths.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathSafetyError {
    #[error("path must be relative: {0}")]
    Absolute(String),
    #[error("path must not contain '..': {0}")]
    ParentComponent(String),
    #[error("path is empty after normalization: {0}")]
    Empty(String),
}

/// Lexically validate a workspace-relative path.
///
/// Accepts only plain relative paths; `.` components are dropped, `..` and
/// absolute paths (including drive prefixes) are refused outright. No symlink
/// is followed and no filesystem access happens here.
///
/// # Errors
///
/// Returns [`PathSafetyError`] when the path could escape the workspace root.
pub fn safe_relative(raw: &str) -> Result<PathBuf, PathSafetyError> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(PathSafetyError::Absolute(raw.to_string()));
    }
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => cleaned.push(part),
            Component::ParentDir => return Err(PathSafetyError::ParentComponent(raw.to_string())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathSafetyError::Absolute(raw.to_string()))
            }
        }
    }
    if cleaned.as_os_str().is_empty() {
        return Err(PathSafetyError::Empty(raw.to_string()));
    }
    Ok(cleaned)
}
