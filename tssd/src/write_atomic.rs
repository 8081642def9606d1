//! Atomic file writes.
//!
//! Data goes to a temporary file next to the destination, which is then
//! renamed over it. The temporary file is created readable and writable by
//! the owner only, and the rename keeps those permissions.

use std::{
    io::{Error, ErrorKind, Result, Write},
    path::{Path, PathBuf},
};

/// Replace the contents of `path` with `data`, creating missing parent
/// directories.
pub fn write_file(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = absolute(path.as_ref())?;
    if path.is_dir() {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("{} is a directory", path.display()),
        ));
    }
    let parent = path
        .parent()
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "path has no parent directory"))?;
    std::fs::create_dir_all(parent)?;

    let mut file = tempfile::Builder::new()
        .prefix(".tssd")
        .tempfile_in(parent)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(&path)?;
    Ok(())
}

/// Relative paths are taken relative to the current directory.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
