// kiln-common/src/receipt.rs
// Persisted record of one installed formula version.
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::dependency::{Dependency, DependencyTag};
use crate::error::{KilnError, Result};
use crate::model::Formula;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledReceipt {
    pub name: String,
    pub version: String,
    pub sha256: String,
    pub source_url: String,
    /// Dependencies as declared when this version was installed.
    pub dependencies: Vec<Dependency>,
    /// Files in the keg, relative to the keg root.
    pub files: Vec<PathBuf>,
    /// Links created in the prefix, relative to the prefix root.
    pub links: Vec<PathBuf>,
    pub installed_at: DateTime<Utc>,
    pub host: String,
}

impl InstalledReceipt {
    pub fn new(formula: &Formula, files: Vec<PathBuf>, links: Vec<PathBuf>) -> Self {
        Self {
            name: formula.name.clone(),
            version: formula.version.clone(),
            sha256: formula.sha256.clone(),
            source_url: formula.url.clone(),
            dependencies: formula.dependencies.clone(),
            files,
            links,
            installed_at: Utc::now(),
            host: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            KilnError::Generic(format!("Corrupt receipt {}: {e}", path.display()))
        })
    }

    pub fn path(&self, config: &Config) -> PathBuf {
        config.receipt_path(&self.name, &self.version)
    }

    pub fn keg_path(&self, config: &Config) -> PathBuf {
        config.formula_keg_path(&self.name, &self.version)
    }

    pub fn depends_at_runtime_on(&self, name: &str) -> bool {
        self.dependencies.iter().any(|d| {
            d.name == name
                && d.tags
                    .intersects(DependencyTag::RUNTIME | DependencyTag::OPTIONAL)
        })
    }
}

/// Loads the receipt for `name` at `version`, if one was written.
pub fn read_receipt(
    config: &Config,
    name: &str,
    version: &str,
) -> Result<Option<InstalledReceipt>> {
    let path = config.receipt_path(name, version);
    if !path.is_file() {
        return Ok(None);
    }
    InstalledReceipt::load(&path).map(Some)
}

/// All receipts recorded for `name`, sorted by version string.
pub fn receipts_for(config: &Config, name: &str) -> Result<Vec<InstalledReceipt>> {
    let dir = config.formula_receipts_dir(name);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut receipts = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match InstalledReceipt::load(&path) {
            Ok(receipt) => receipts.push(receipt),
            Err(e) => warn!("Skipping unreadable receipt {}: {}", path.display(), e),
        }
    }
    receipts.sort_by(|a, b| a.version.cmp(&b.version));
    debug!("Found {} receipt(s) for '{}'", receipts.len(), name);
    Ok(receipts)
}

/// Every receipt under the receipts directory.
pub fn all_receipts(config: &Config) -> Result<Vec<InstalledReceipt>> {
    let dir = config.receipts_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    let mut out = Vec::new();
    for name in names {
        out.extend(receipts_for(config, &name)?);
    }
    Ok(out)
}
