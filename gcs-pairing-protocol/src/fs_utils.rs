//! File System Utilities with Enhanced Error Handling
//!
//! Small synchronous helpers used by the device cache: directory creation,
//! atomic replacement of a file, and tolerant deletion.

use crate::{ProtocolError, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

/// Ensure a directory exists, creating it if necessary
///
/// # Errors
///
/// Returns `PermissionDenied` if creation fails due to permissions.
/// Returns `Io` for other filesystem errors.
pub fn ensure_dir(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    if dir.is_dir() {
        return Ok(());
    }

    debug!("Creating directory: {}", dir.display());
    fs::create_dir_all(dir)
        .map_err(|e| ProtocolError::from_io_error(e, &format!("creating directory {}", dir.display())))
}

/// Replace `path` with `data` atomically
///
/// Writes a sibling temp file, syncs it, then renames it over the target so
/// a crash never leaves a half-written record behind.
pub fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let tmp_path = path.with_extension("tmp");

    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(data)?;
        file.sync_all()
    });
    if let Err(e) = written {
        cleanup_partial_file(&tmp_path);
        return Err(ProtocolError::from_io_error(
            e,
            &format!("writing {}", tmp_path.display()),
        ));
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        cleanup_partial_file(&tmp_path);
        ProtocolError::from_io_error(e, &format!("replacing {}", path.display()))
    })
}

/// Delete a file; a file that is already gone is not an error
pub fn remove_if_exists(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed file: {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProtocolError::from_io_error(
            e,
            &format!("removing {}", path.display()),
        )),
    }
}

/// Clean up partial file on error
///
/// Attempts to delete a partially written file. Logs errors but doesn't fail.
pub fn cleanup_partial_file(path: impl AsRef<Path>) {
    let path = path.as_ref();

    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(
                "Failed to clean up partial file {}: {}",
                path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("record.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_remove_if_exists_tolerates_missing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gone.json");

        assert!(remove_if_exists(&path).is_ok());
        fs::write(&path, b"x").unwrap();
        assert!(remove_if_exists(&path).is_ok());
        assert!(!path.exists());
    }

    #[test]
    fn test_ensure_dir_nested() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");

        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_dir(&nested).unwrap();
    }
}
