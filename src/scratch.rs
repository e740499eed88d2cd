//! Transient files in the download directory.
//!
//! Intermediate artifacts are [`TempPath`]s and [`TempDir`]s with random
//! names. They are removed when dropped, on success and failure alike,
//! unless persisted into their final place first.

use std::path::Path;

use tempfile::{Builder, TempDir, TempPath};

use crate::error::Result;

/// Permissions of finished outputs: owner read/write, group read.
#[cfg(unix)]
pub const OUTPUT_MODE: u32 = 0o640;

/// Creates an empty, randomly named file ending in `suffix` inside `dir`.
///
/// # Errors
///
/// Returns an error if the file cannot be created.
pub fn file_in(dir: &Path, suffix: &str) -> Result<TempPath> {
    let path = Builder::new()
        .suffix(suffix)
        .tempfile_in(dir)?
        .into_temp_path();
    trace!("created {}", path.display());
    Ok(path)
}

/// Creates a randomly named directory starting with `prefix` inside `dir`.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn dir_in(dir: &Path, prefix: &str) -> Result<TempDir> {
    Ok(Builder::new().prefix(prefix).tempdir_in(dir)?)
}

/// Atomically moves `path` to `dest`.
///
/// # Errors
///
/// Returns an error if the rename fails, in which case the scratch file is
/// removed.
pub fn persist(path: TempPath, dest: &Path) -> Result<()> {
    path.persist(dest)?;
    trace!("persisted {}", dest.display());
    Ok(())
}

/// Restricts a finished output to [`OUTPUT_MODE`].
///
/// # Errors
///
/// Returns an error if the permissions cannot be changed.
pub async fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::{fs::Permissions, os::unix::fs::PermissionsExt};
        tokio::fs::set_permissions(path, Permissions::from_mode(OUTPUT_MODE)).await?;
    }

    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}
