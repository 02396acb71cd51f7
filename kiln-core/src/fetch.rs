// kiln-core/src/fetch.rs
// Source Acquirer: cache lookup, download, digest check, promotion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_aio::checksum::{digest_matches, sha256_file_async};
use kiln_aio::fs::{remove_path, sibling_temp_path};
use kiln_aio::lock::PathLock;
use kiln_common::cache::DownloadCache;
use kiln_common::error::{KilnError, Result};
use kiln_common::SourceTransport;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// A source file on disk whose digest matched the declared one.
///
/// Only [`SourceAcquirer::fetch`] constructs this, and only after the check
/// passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
    path: PathBuf,
    sha256: String,
    url: String,
    size_bytes: u64,
    cached: bool,
}

impl FetchedSource {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Served from the cache without a transfer.
    pub fn cached(&self) -> bool {
        self.cached
    }

    #[cfg(test)]
    pub(crate) fn for_tests(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            sha256: "0".repeat(64),
            url: format!("file://{}", path.display()),
            size_bytes: 0,
            cached: true,
        }
    }
}

pub struct SourceAcquirer {
    cache: DownloadCache,
    transport: Arc<dyn SourceTransport>,
}

impl SourceAcquirer {
    pub fn new(cache: DownloadCache, transport: Arc<dyn SourceTransport>) -> Self {
        Self { cache, transport }
    }

    pub fn cache(&self) -> &DownloadCache {
        &self.cache
    }

    /// Returns the verified source for `url`, downloading it if the cache
    /// has no intact entry. Writers of the same cache key are serialised by
    /// an advisory lock; the entry only ever appears through a rename.
    #[instrument(skip(self, cancel), fields(url = %url))]
    pub async fn fetch(
        &self,
        url: &str,
        expected_sha256: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedSource> {
        let expected = expected_sha256.to_ascii_lowercase();
        let entry = self.cache.entry_path(url, &expected);
        let _lock = PathLock::acquire_async(self.cache.lock_path(url, &expected), cancel).await?;

        if let Some(hit) = self.cached_entry(url, &expected, &entry).await? {
            return Ok(hit);
        }

        let temp = sibling_temp_path(&entry, "part");
        let result = self.download_and_check(url, &expected, &temp, cancel).await;
        let size_bytes = match result {
            Ok(size) => size,
            Err(e) => {
                if let Err(rm) = remove_path(&temp) {
                    warn!("Could not remove partial download {}: {}", temp.display(), rm);
                }
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&temp, &entry).await {
            if let Err(rm) = remove_path(&temp) {
                warn!("Could not remove unpromoted download {}: {}", temp.display(), rm);
            }
            return Err(e.into());
        }
        debug!("Cached {} as {}", url, entry.display());
        Ok(FetchedSource {
            path: entry,
            sha256: expected,
            url: url.to_string(),
            size_bytes,
            cached: false,
        })
    }

    async fn cached_entry(
        &self,
        url: &str,
        expected: &str,
        entry: &Path,
    ) -> Result<Option<FetchedSource>> {
        if !entry.is_file() {
            debug!("Cache miss for {}", url);
            return Ok(None);
        }
        let actual = sha256_file_async(entry).await?;
        if digest_matches(&actual, expected) {
            debug!("Using cached file {}", entry.display());
            let size_bytes = tokio::fs::metadata(entry).await?.len();
            return Ok(Some(FetchedSource {
                path: entry.to_path_buf(),
                sha256: expected.to_string(),
                url: url.to_string(),
                size_bytes,
                cached: true,
            }));
        }
        warn!(
            "Cached file {} is corrupt (expected {}, found {}); fetching again",
            entry.display(),
            expected,
            actual
        );
        remove_path(entry)?;
        Ok(None)
    }

    async fn download_and_check(
        &self,
        url: &str,
        expected: &str,
        temp: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if let Some(parent) = temp.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let size = self.transport.download(url, temp, cancel).await?;
        let actual = sha256_file_async(temp).await?;
        if !digest_matches(&actual, expected) {
            return Err(KilnError::Integrity {
                url: url.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(size)
    }
}
