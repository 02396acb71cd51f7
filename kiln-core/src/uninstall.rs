// kiln-core/src/uninstall.rs
use std::collections::HashSet;
use std::fs;

use kiln_aio::fs::remove_path;
use kiln_aio::lock::PathLock;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::KegRegistry;
use kiln_common::model::formula::is_safe_segment;
use kiln_common::receipt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::install::link::{link_owner, remove_links, LinkOwner};

#[derive(Debug, Clone, Copy, Default)]
pub struct UninstallOptions {
    /// Remove the formula even if other installed formulae need it at runtime.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallReport {
    pub name: String,
    pub removed_versions: Vec<String>,
    pub removed_links: usize,
}

/// Installed formulae (other than `name`) whose active version declares a
/// runtime dependency on `name`.
pub fn installed_dependents(config: &Config, name: &str) -> Result<Vec<String>> {
    let mut dependents: Vec<String> = KegRegistry::new(config.clone())
        .list_installed_kegs()?
        .into_iter()
        .filter(|keg| keg.active && keg.name != name && keg.receipt.depends_at_runtime_on(name))
        .map(|keg| keg.name)
        .collect();
    dependents.dedup();
    Ok(dependents)
}

/// Removes every installed version of `name` together with its links and
/// receipts, holding the same per-formula lock as installs.
#[instrument(skip(config, cancel))]
pub async fn uninstall(
    config: &Config,
    name: &str,
    options: UninstallOptions,
    cancel: &CancellationToken,
) -> Result<UninstallReport> {
    if !is_safe_segment(name) {
        return Err(KilnError::Uninstall(format!("'{name}' is not a valid formula name")));
    }
    let _lock = PathLock::acquire_async(config.formula_lock_path(name), cancel).await?;
    let config = config.clone();
    let name = name.to_string();
    tokio::task::spawn_blocking(move || remove_formula(&config, &name, options))
        .await
        .map_err(|e| KilnError::Uninstall(format!("Uninstall task failed: {e}")))?
}

fn remove_formula(
    config: &Config,
    name: &str,
    options: UninstallOptions,
) -> Result<UninstallReport> {
    let receipts = receipt::receipts_for(config, name)?;
    if receipts.is_empty() {
        return Err(KilnError::NotInstalled(name.to_string()));
    }

    let dependents = installed_dependents(config, name)?;
    if !dependents.is_empty() {
        if !options.force {
            return Err(KilnError::Uninstall(format!(
                "{name} is required by {}; pass --force to remove it anyway",
                dependents.join(", ")
            )));
        }
        warn!("Removing {} although {} depend on it", name, dependents.join(", "));
    }

    let mut report = UninstallReport {
        name: name.to_string(),
        removed_versions: Vec::new(),
        removed_links: 0,
    };
    let nothing_kept = HashSet::new();
    for r in &receipts {
        report.removed_links += remove_links(config, r, &nothing_kept);
        let keg = r.keg_path(config);
        if keg.exists() {
            debug!("Removing keg {}", keg.display());
            remove_path(&keg).map_err(|e| {
                KilnError::Uninstall(format!("Failed to remove keg {}: {e}", keg.display()))
            })?;
        }
        remove_path(&r.path(config))?;
        report.removed_versions.push(r.version.clone());
    }

    // An opt link left by an interrupted run.
    let opt = config.formula_opt_path(name);
    if link_owner(config, name, &opt) == LinkOwner::Same {
        remove_path(&opt)?;
    }
    for dir in [config.formula_receipts_dir(name), config.formula_cellar_dir(name)] {
        match fs::remove_dir(&dir) {
            Ok(()) => debug!("Removed {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("Left {} in place: {}", dir.display(), e),
        }
    }

    info!(
        "Uninstalled {} ({} version(s), {} link(s))",
        name,
        report.removed_versions.len(),
        report.removed_links
    );
    Ok(report)
}
