use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256, Sha512};

use vx_domain::{Checksum, ChecksumAlgo};

/// Best-effort directory fsync so a rename survives a crash.
pub(crate) fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn remove_path_for_replace(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("failed to stat {}", path.display())),
    };
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        fs::remove_file(path)
            .or_else(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    fs::remove_dir(path).or_else(|dir_err| {
                        if dir_err.kind() == io::ErrorKind::NotFound {
                            Ok(())
                        } else {
                            Err(dir_err)
                        }
                    })
                }
            })
            .with_context(|| format!("failed to remove symlink {}", path.display()))?;
        return Ok(());
    }

    if file_type.is_dir() {
        // `remove_dir` first so a directory link never takes its target with it.
        if fs::remove_dir(path).is_ok() {
            return Ok(());
        }
        fs::remove_dir_all(path)
            .with_context(|| format!("failed to remove dir {}", path.display()))?;
        return Ok(());
    }

    fs::remove_file(path).with_context(|| format!("failed to remove file {}", path.display()))?;
    Ok(())
}

/// Replace `link` with a symlink pointing at `target`.
///
/// A pre-existing non-symlink at `link` is refused unless `overwrite` is set;
/// projections must never silently destroy user data.
///
/// # Errors
///
/// Returns an error when the target is absent, the existing entry is not a
/// symlink (without `overwrite`), or the symlink cannot be created.
pub fn replace_link(target: &Path, link: &Path, overwrite: bool) -> Result<()> {
    if fs::symlink_metadata(target).is_err() {
        return Err(anyhow!(
            "cannot create link; target does not exist: {}",
            target.display()
        ));
    }
    if let Ok(meta) = fs::symlink_metadata(link) {
        if !meta.file_type().is_symlink() && !overwrite {
            return Err(anyhow!(
                "refusing to replace non-symlink {} (pass --overwrite to force)",
                link.display()
            ));
        }
    }
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    remove_path_for_replace(link)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::symlink;
        match symlink(target, link) {
            Ok(()) => Ok(()),
            // Concurrent projector won the race; the link exists either way.
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!(
                    "failed to create symlink {} -> {}",
                    link.display(),
                    target.display()
                )
            }),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (target, link);
        Err(anyhow!("symlink projection requires a Unix host"))
    }
}

/// Stream a file through the hasher the checksum declares.
///
/// # Errors
///
/// Returns an error when the file cannot be read.
pub fn hash_file(path: &Path, algo: ChecksumAlgo) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    match algo {
        ChecksumAlgo::Sha256 => {
            let mut hasher = Sha256::new();
            stream_into(&mut file, |chunk| hasher.update(chunk))?;
            Ok(hex::encode(hasher.finalize()))
        }
        ChecksumAlgo::Sha512 => {
            let mut hasher = Sha512::new();
            stream_into(&mut file, |chunk| hasher.update(chunk))?;
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

fn stream_into(file: &mut File, mut update: impl FnMut(&[u8])) -> Result<()> {
    let mut buf = vec![0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            return Ok(());
        }
        update(&buf[..read]);
    }
}

/// Compute a file's checksum with the given algorithm.
///
/// # Errors
///
/// Returns an error when the file cannot be read.
pub fn file_checksum(path: &Path, algo: ChecksumAlgo) -> Result<Checksum> {
    Ok(Checksum {
        algo,
        hex: hash_file(path, algo)?,
    })
}

/// Hex SHA-256 of a byte string.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
