//! Making endpoints reachable at well-known paths.

use std::{
    fs, io,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::error::Error;

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

fn is_alias(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(meta.file_type().is_symlink()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Point `path` at `target`.
///
/// An existing alias at `path` is replaced in one step,
/// so clients never see the path missing.
/// Anything else at `path` is left alone and reported.
pub(crate) fn publish(path: &Path, target: &Path) -> Result<(), Error> {
    let publish_error = |source| Error::Publish {
        path: path.to_path_buf(),
        source,
    };

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            debug!(?path, "Replacing stale alias");
        }
        Ok(_) => return Err(Error::PathOccupied(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(publish_error(e)),
    }

    let staging = staging_path(path);

    // Leftover from an earlier run which did not get to clean up.
    if is_alias(&staging).unwrap_or(false) {
        let _ = fs::remove_file(&staging);
    }

    symlink(target, &staging).map_err(publish_error)?;

    if let Err(e) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(publish_error(e));
    }

    Ok(())
}

/// Remove the alias at `path`.
/// Returns whether something was removed.
pub(crate) fn unpublish(path: &Path) -> bool {
    match is_alias(path) {
        Ok(true) => fs::remove_file(path).is_ok(),
        _ => false,
    }
}
