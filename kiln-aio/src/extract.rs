// kiln-aio/src/extract.rs
// Unpacks fetched sources into a build directory.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use kiln_common::error::{KilnError, Result};
use tracing::{debug, warn};
use xz2::read::XzDecoder;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    TarXz,
    TarBz2,
    Tar,
    Zip,
    /// Anything else is copied in as a single file.
    Plain,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            ArchiveKind::TarXz
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".tbz") {
            ArchiveKind::TarBz2
        } else if name.ends_with(".tar") {
            ArchiveKind::Tar
        } else if name.ends_with(".zip") {
            ArchiveKind::Zip
        } else {
            ArchiveKind::Plain
        }
    }
}

fn unpack_tar<R: Read>(reader: R, target_dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    // `unpack` skips entries that would land outside `target_dir`.
    archive
        .unpack(target_dir)
        .map_err(|e| KilnError::Generic(format!("Failed to unpack TAR: {e}")))
}

fn unpack_zip(file: File, target_dir: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(BufReader::new(file))
        .map_err(|e| KilnError::Generic(format!("Failed to open ZIP: {e}")))?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| KilnError::Generic(format!("Failed to access ZIP entry: {e}")))?;
        let Some(rel) = entry.enclosed_name() else {
            warn!("Skipping ZIP entry with unsafe path: {}", entry.name());
            continue;
        };
        let outpath = target_dir.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&outpath)?;
        std::io::copy(&mut entry, &mut outfile)?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&outpath, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// Extracts `archive_path` into `target_dir` and returns the directory the
/// build should run in: the single top-level directory when the archive has
/// exactly one, `target_dir` otherwise.
pub fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<PathBuf> {
    let kind = ArchiveKind::detect(archive_path);
    debug!(
        "Extracting '{}' ({:?}) to '{}'",
        archive_path.display(),
        kind,
        target_dir.display()
    );
    fs::create_dir_all(target_dir)?;

    match kind {
        ArchiveKind::TarGz => unpack_tar(GzDecoder::new(File::open(archive_path)?), target_dir)?,
        ArchiveKind::TarXz => unpack_tar(XzDecoder::new(File::open(archive_path)?), target_dir)?,
        ArchiveKind::TarBz2 => unpack_tar(BzDecoder::new(File::open(archive_path)?), target_dir)?,
        ArchiveKind::Tar => unpack_tar(File::open(archive_path)?, target_dir)?,
        ArchiveKind::Zip => unpack_zip(File::open(archive_path)?, target_dir)?,
        ArchiveKind::Plain => {
            let name = archive_path
                .file_name()
                .ok_or_else(|| KilnError::Generic("Source path has no file name".to_string()))?;
            fs::copy(archive_path, target_dir.join(name))?;
            return Ok(target_dir.to_path_buf());
        }
    }
    determine_content_root(target_dir)
}

/// Off-thread variant of [`extract_archive`].
pub async fn extract_archive_async(archive_path: &Path, target_dir: &Path) -> Result<PathBuf> {
    let archive_path = archive_path.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_archive(&archive_path, &target_dir))
        .await
        .map_err(|e| KilnError::Generic(format!("JoinError in extraction: {e}")))?
}

/// GitHub-style tarballs wrap everything in one `<repo>-<tag>/` directory.
pub fn determine_content_root(extracted: &Path) -> Result<PathBuf> {
    let entries: Vec<PathBuf> = fs::read_dir(extracted)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .map(|n| n != ".DS_Store" && n != "pax_global_header")
                .unwrap_or(false)
        })
        .collect();
    if let [only] = entries.as_slice() {
        if only.is_dir() {
            debug!("Using single top-level directory {}", only.display());
            return Ok(only.clone());
        }
    }
    Ok(extracted.to_path_buf())
}
