// kiln-common/src/cache.rs
// Layout of the content-addressed download cache.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::Config;

/// Download cache rooted at `<cache>/downloads`. Entries are keyed by the
/// expected digest plus a hash of the URL they came from.
#[derive(Debug, Clone)]
pub struct DownloadCache {
    dir: PathBuf,
}

impl DownloadCache {
    pub fn new(config: &Config) -> Self {
        Self {
            dir: config.downloads_dir(),
        }
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.dir.join(".locks")
    }

    /// `<sha256>--<first 16 hex of sha256(url)>`
    pub fn key(url: &str, sha256: &str) -> String {
        let url_hash = hex::encode(Sha256::digest(url.as_bytes()));
        format!("{}--{}", sha256.to_ascii_lowercase(), &url_hash[..16])
    }

    pub fn entry_path(&self, url: &str, sha256: &str) -> PathBuf {
        self.dir
            .join(format!("{}--{}", Self::key(url, sha256), url_basename(url)))
    }

    pub fn lock_path(&self, url: &str, sha256: &str) -> PathBuf {
        self.locks_dir()
            .join(format!("{}.lock", Self::key(url, sha256)))
    }
}

/// Last path segment of `url`, restricted to characters safe in a file name.
pub fn url_basename(url: &str) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    let raw = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "source".to_string()
    } else {
        cleaned
    }
}
