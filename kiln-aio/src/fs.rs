/*
File: kiln-aio/src/fs.rs
Purpose: Primitive synchronous filesystem operations.
*/
use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::error::{KilnError, Result};
use rand::distr::Alphanumeric;
use rand::Rng;
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};
use walkdir::WalkDir;

/// Checks if a path exists without following symlinks.
pub fn check_symlink_exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

pub fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Creates a directory and all its parent components if they are missing.
pub fn create_dir_all(path: &Path) -> Result<()> {
    debug!("Creating directory recursively: {}", path.display());
    fs::create_dir_all(path).map_err(|e| {
        error!("Failed create dir {}: {}", path.display(), e);
        KilnError::from(e)
    })
}

/// Removes whatever is at `path` (file, symlink or directory tree). Missing
/// paths are not an error.
pub fn remove_path(path: &Path) -> Result<()> {
    let meta = match path.symlink_metadata() {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let result = if meta.is_dir() {
        debug!("Removing directory recursively: {}", path.display());
        fs::remove_dir_all(path)
    } else {
        debug!("Removing file: {}", path.display());
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            error!("Failed to remove {}: {}", path.display(), e);
            Err(e.into())
        }
    }
}

/// Removes empty parent directories of `path` up to (not including) `stop_at`.
pub fn prune_empty_parents(path: &Path, stop_at: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        match fs::remove_dir(dir) {
            Ok(()) => debug!("Removed empty directory {}", dir.display()),
            Err(_) => break,
        }
        current = dir.parent();
    }
}

/// A sibling path of `path` with a random suffix, e.g. `foo.tmp-Ab12Cd34`.
pub fn sibling_temp_path(path: &Path, tag: &str) -> PathBuf {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{tag}-{suffix}"))
}

/// Points `link` at `target`, replacing any existing symlink in one rename.
/// Refuses to replace anything that is not a symlink.
pub fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        create_dir_all(parent)?;
    }
    if check_symlink_exists(link) && !is_symlink(link) {
        return Err(KilnError::Install(format!(
            "Refusing to replace non-symlink at {}",
            link.display()
        )));
    }
    let temp = sibling_temp_path(link, "link");
    symlink(target, &temp).map_err(|e| {
        error!(
            "Failed create symlink {} -> {}: {}",
            temp.display(),
            target.display(),
            e
        );
        KilnError::from(e)
    })?;
    if let Err(e) = fs::rename(&temp, link) {
        let _ = fs::remove_file(&temp);
        error!("Failed to move symlink into place at {}: {}", link.display(), e);
        return Err(e.into());
    }
    debug!("Linked {} -> {}", link.display(), target.display());
    Ok(())
}

/// Sets file permissions. Mode is standard Unix octal mode.
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    debug!("Setting permissions on {}: {:o}", path.display(), mode);
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| {
        error!("Failed set permissions on {}: {}", path.display(), e);
        KilnError::from(e)
    })
}

/// Atomically writes data to a file using a temporary file in the same directory.
pub fn atomic_write_file(original_path: &Path, content: &[u8]) -> Result<()> {
    let dir = original_path.parent().ok_or_else(|| {
        KilnError::Generic(format!(
            "Cannot get parent directory for {}",
            original_path.display()
        ))
    })?;
    create_dir_all(dir)?;

    let mut temp_file = NamedTempFile::new_in(dir)?;
    let temp_path = temp_file.path().to_path_buf();

    debug!(
        "Atomically writing {} bytes to {} via temp file {}",
        content.len(),
        original_path.display(),
        temp_path.display()
    );

    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;

    temp_file.persist(original_path).map_err(|e| {
        error!(
            "Failed to persist temporary file {} over {}: {}",
            temp_path.display(),
            original_path.display(),
            e.error
        );
        KilnError::Io(Arc::new(e.error))
    })?;

    if let Err(e) = set_permissions(original_path, 0o644) {
        warn!(
            "Failed to set permissions on {}: {}",
            original_path.display(),
            e
        );
    }
    Ok(())
}

/// Copies the tree under `src` into `dst` (created if needed), preserving
/// symlinks and permission bits. Returns the copied file paths relative to
/// `dst`, sorted.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<Vec<PathBuf>> {
    create_dir_all(dst)?;
    let mut copied = Vec::new();
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            KilnError::Generic(format!("Failed to walk {}: {e}", src.display()))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| KilnError::Generic(e.to_string()))?
            .to_path_buf();
        let target = dst.join(&rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            let mode = entry.metadata().map(|m| m.permissions().mode()).unwrap_or(0o755);
            fs::set_permissions(&target, Permissions::from_mode(mode | 0o700))?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path())?;
            symlink(&link_target, &target)?;
            copied.push(rel);
        } else {
            fs::copy(entry.path(), &target)?;
            copied.push(rel);
        }
    }
    copied.sort();
    debug!(
        "Copied {} entries from {} to {}",
        copied.len(),
        src.display(),
        dst.display()
    );
    Ok(copied)
}
