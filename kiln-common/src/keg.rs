// kiln-common/src/keg.rs
use std::fs;
use std::path::PathBuf;

use tracing::debug;

use super::config::Config;
use super::error::Result;
use super::receipt::{self, InstalledReceipt};

/// An installed formula version (keg) in the cellar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledKeg {
    pub name: String,
    pub version_str: String,
    pub path: PathBuf,
    /// Whether `opt/<name>` currently points at this keg.
    pub active: bool,
    pub receipt: InstalledReceipt,
}

/// Answers questions about what is installed. A keg counts as installed when
/// its receipt exists and its cellar directory is present.
#[derive(Debug, Clone)]
pub struct KegRegistry {
    config: Config,
}

impl KegRegistry {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Version the opt link of `name` points at, if any.
    pub fn active_version(&self, name: &str) -> Option<String> {
        let opt = self.config.formula_opt_path(name);
        let target = fs::read_link(&opt).ok()?;
        let target = if target.is_relative() {
            opt.parent()?.join(target)
        } else {
            target
        };
        let version = target.file_name()?.to_str()?.to_string();
        debug!("[KEG_REGISTRY:{}] active version is {}", name, version);
        Some(version)
    }

    pub fn installed_kegs(&self, name: &str) -> Result<Vec<InstalledKeg>> {
        let active = self.active_version(name);
        Ok(receipt::receipts_for(&self.config, name)?
            .into_iter()
            .filter_map(|r| self.keg_from_receipt(r, active.as_deref()))
            .collect())
    }

    pub fn get_active_keg(&self, name: &str) -> Result<Option<InstalledKeg>> {
        Ok(self.installed_kegs(name)?.into_iter().find(|k| k.active))
    }

    pub fn get_installed_keg(&self, name: &str, version: &str) -> Result<Option<InstalledKeg>> {
        let active = self.active_version(name);
        Ok(receipt::read_receipt(&self.config, name, version)?
            .and_then(|r| self.keg_from_receipt(r, active.as_deref())))
    }

    pub fn list_installed_kegs(&self) -> Result<Vec<InstalledKeg>> {
        let mut kegs = Vec::new();
        let mut active_cache: Option<(String, Option<String>)> = None;
        for r in receipt::all_receipts(&self.config)? {
            let active = match &active_cache {
                Some((name, active)) if *name == r.name => active.clone(),
                _ => {
                    let active = self.active_version(&r.name);
                    active_cache = Some((r.name.clone(), active.clone()));
                    active
                }
            };
            if let Some(keg) = self.keg_from_receipt(r, active.as_deref()) {
                kegs.push(keg);
            }
        }
        debug!("[KEG_REGISTRY] {} installed keg(s)", kegs.len());
        Ok(kegs)
    }

    fn keg_from_receipt(&self, r: InstalledReceipt, active: Option<&str>) -> Option<InstalledKeg> {
        let path = r.keg_path(&self.config);
        if !path.is_dir() {
            debug!(
                "[KEG_REGISTRY:{}] receipt for {} has no keg at {}",
                r.name,
                r.version,
                path.display()
            );
            return None;
        }
        Some(InstalledKeg {
            name: r.name.clone(),
            version_str: r.version.clone(),
            active: active == Some(r.version.as_str()),
            path,
            receipt: r,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use tempfile::TempDir;

    use super::*;

    fn install_fake(config: &Config, name: &str, version: &str) {
        let keg = config.formula_keg_path(name, version);
        fs::create_dir_all(keg.join("bin")).unwrap();
        let r = InstalledReceipt {
            name: name.to_string(),
            version: version.to_string(),
            sha256: "0".repeat(64),
            source_url: "https://example.com/x.tar.gz".to_string(),
            dependencies: vec![],
            files: vec![],
            links: vec![],
            installed_at: chrono::Utc::now(),
            host: "test".to_string(),
        };
        let path = r.path(config);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_vec(&r).unwrap()).unwrap();
    }

    #[test]
    fn active_keg_follows_opt_link() {
        let root = TempDir::new().unwrap();
        let config = Config::with_root(root.path());
        install_fake(&config, "guise", "0.1.0");
        install_fake(&config, "guise", "0.2.0");
        let registry = KegRegistry::new(config.clone());

        assert!(registry.get_active_keg("guise").unwrap().is_none());

        fs::create_dir_all(config.opt_dir()).unwrap();
        symlink(
            config.formula_keg_path("guise", "0.1.0"),
            config.formula_opt_path("guise"),
        )
        .unwrap();

        let active = registry.get_active_keg("guise").unwrap().unwrap();
        assert_eq!(active.version_str, "0.1.0");
        assert_eq!(registry.installed_kegs("guise").unwrap().len(), 2);
        assert_eq!(registry.list_installed_kegs().unwrap().len(), 2);
    }

    #[test]
    fn receipt_without_keg_is_not_installed() {
        let root = TempDir::new().unwrap();
        let config = Config::with_root(root.path());
        install_fake(&config, "go", "1.22");
        fs::remove_dir_all(config.formula_keg_path("go", "1.22")).unwrap();
        let registry = KegRegistry::new(config);
        assert!(registry.get_installed_keg("go", "1.22").unwrap().is_none());
    }
}
