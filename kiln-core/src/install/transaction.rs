// kiln-core/src/install/transaction.rs
//
// Staged install into the cellar. Nothing outside the staging directory is
// touched until the staged keg is complete; activation is a rename of the
// staged keg followed by journaled link replacement, and the receipt is the
// last thing written.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use kiln_aio::fs::{copy_tree, remove_path, sibling_temp_path};
use kiln_aio::json_io::write_json_atomic;
use kiln_aio::lock::PathLock;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::KegRegistry;
use kiln_common::model::Formula;
use kiln_common::receipt::{self, InstalledReceipt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::link::{check_conflicts, plan_links, remove_links, LinkJournal, PlannedLink};
use crate::build::BuildResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed(InstalledReceipt),
    /// The same version was already committed; nothing was changed.
    AlreadyInstalled(InstalledReceipt),
}

impl InstallOutcome {
    pub fn receipt(&self) -> &InstalledReceipt {
        match self {
            InstallOutcome::Installed(r) | InstallOutcome::AlreadyInstalled(r) => r,
        }
    }

    pub fn was_installed(&self) -> bool {
        matches!(self, InstallOutcome::Installed(_))
    }
}

/// Receipt of `formula`'s exact version when it is installed and active.
pub fn active_install(config: &Config, formula: &Formula) -> Result<Option<InstalledReceipt>> {
    let registry = KegRegistry::new(config.clone());
    Ok(registry
        .get_installed_keg(&formula.name, &formula.version)?
        .filter(|keg| keg.active)
        .map(|keg| keg.receipt))
}

/// Commits the output of `build` as `<cellar>/<name>/<version>` and links it
/// into the prefix. Serialised per formula name by an advisory lock, so of
/// two concurrent installs of the same version exactly one commits and the
/// other reports [`InstallOutcome::AlreadyInstalled`].
#[instrument(skip_all, fields(formula = %formula.name))]
pub async fn install(
    config: &Config,
    formula: &Formula,
    build: &BuildResult,
    cancel: &CancellationToken,
) -> Result<InstallOutcome> {
    let _lock = PathLock::acquire_async(config.formula_lock_path(&formula.name), cancel).await?;
    let config = config.clone();
    let formula = formula.clone();
    let output = build.output_dir().to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || commit(&config, &formula, &output, &cancel))
        .await
        .map_err(|e| KilnError::Install(format!("Install task failed: {e}")))?
}

/// The blocking part of [`install`]. The caller holds the formula lock.
pub(crate) fn commit(
    config: &Config,
    formula: &Formula,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<InstallOutcome> {
    let name = formula.name.as_str();
    let keg = config.formula_keg_path(name, &formula.version);

    if let Some(existing) = receipt::read_receipt(config, name, &formula.version)? {
        if keg.is_dir() {
            if active_version(config, name).as_deref() == Some(formula.version.as_str()) {
                debug!("[INSTALL:{}] {} already committed", name, formula.version);
                return Ok(InstallOutcome::AlreadyInstalled(existing));
            }
            // Committed earlier but another version is active: relink only.
            let plan = plan_links(config, name, &keg, &keg)?;
            check_conflicts(config, name, &plan)?;
            let (_, previous) = activate(config, name, &existing.version, &plan)?;
            if let Some(previous) = previous {
                drop_stale_links(config, name, &previous, &existing.links);
            }
            info!("Activated installed {} {}", name, existing.version);
            return Ok(InstallOutcome::AlreadyInstalled(existing));
        }
        warn!(
            "Receipt for {} {} has no keg; reinstalling",
            name, formula.version
        );
    }

    let cellar = config.formula_cellar_dir(name);
    fs::create_dir_all(&cellar)?;
    clear_leftovers(&cellar, &formula.version)?;
    if keg.exists() {
        // A keg without a receipt is the remnant of an interrupted run.
        let aside = sibling_temp_path(&keg, "stale");
        warn!("Removing incomplete keg {}", keg.display());
        fs::rename(&keg, &aside)?;
        remove_path(&aside)?;
    }

    let staging = sibling_temp_path(&keg, "staging");
    let staged = stage(config, name, output, &staging, &keg, cancel);
    let (files, plan) = match staged {
        Ok(staged) => staged,
        Err(e) => {
            discard(&staging);
            return Err(e);
        }
    };

    fs::rename(&staging, &keg).map_err(|e| {
        discard(&staging);
        KilnError::Install(format!("Failed to move staged keg into {}: {e}", keg.display()))
    })?;
    debug!("[INSTALL:{}] keg committed at {}", name, keg.display());

    let links: Vec<PathBuf> = plan.iter().map(|p| p.rel.clone()).collect();
    let receipt = InstalledReceipt::new(formula, files, links);
    let (journal, previous) = match activate(config, name, &formula.version, &plan) {
        Ok(activated) => activated,
        Err(e) => {
            discard(&keg);
            return Err(e);
        }
    };
    if let Err(e) = write_json_atomic(&receipt.path(config), &receipt) {
        journal.rollback();
        discard(&keg);
        return Err(KilnError::Install(format!("Writing receipt for {name} failed: {e}")));
    }
    if let Some(previous) = previous {
        drop_stale_links(config, name, &previous, &receipt.links);
    }

    info!("Installed {} {} into {}", name, formula.version, keg.display());
    Ok(InstallOutcome::Installed(receipt))
}

fn active_version(config: &Config, name: &str) -> Option<String> {
    KegRegistry::new(config.clone()).active_version(name)
}

/// Applies `plan`, rolling every link back if one fails. Also returns the
/// receipt of the version that was active before; its leftover links are
/// removed once the new version is fully committed.
fn activate(
    config: &Config,
    name: &str,
    version: &str,
    plan: &[PlannedLink],
) -> Result<(LinkJournal, Option<InstalledReceipt>)> {
    let previous = KegRegistry::new(config.clone())
        .get_active_keg(name)?
        .filter(|active| active.version_str != version)
        .map(|active| active.receipt);

    let mut journal = LinkJournal::new(config);
    if let Err(e) = journal.apply(plan) {
        journal.rollback();
        return Err(KilnError::Install(format!("Linking {name} failed: {e}")));
    }
    debug!("[INSTALL:{}] linked {} path(s) for {}", name, plan.len(), version);
    Ok((journal, previous))
}

fn drop_stale_links(config: &Config, name: &str, previous: &InstalledReceipt, links: &[PathBuf]) {
    let keep: HashSet<PathBuf> = links.iter().cloned().collect();
    let removed = remove_links(config, previous, &keep);
    debug!(
        "[INSTALL:{}] removed {} stale link(s) of {}",
        name, removed, previous.version
    );
}

/// Copies the build output into `staging` and plans its links. The final
/// point at which cancellation is honoured.
fn stage(
    config: &Config,
    name: &str,
    output: &Path,
    staging: &Path,
    keg: &Path,
    cancel: &CancellationToken,
) -> Result<(Vec<PathBuf>, Vec<PlannedLink>)> {
    let files = copy_tree(output, staging)?;
    if files.is_empty() {
        return Err(KilnError::Install(format!(
            "The install steps of {name} produced no files under the prefix"
        )));
    }
    let plan = plan_links(config, name, staging, keg)?;
    check_conflicts(config, name, &plan)?;
    if cancel.is_cancelled() {
        return Err(KilnError::Cancelled);
    }
    Ok((files, plan))
}

/// Removes staging and stale directories other runs left for `version`.
fn clear_leftovers(cellar: &Path, version: &str) -> Result<()> {
    let prefixes = [format!(".{version}.staging-"), format!(".{version}.stale-")];
    for entry in fs::read_dir(cellar)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if prefixes.iter().any(|p| file_name.starts_with(p.as_str())) {
            debug!("Removing leftover {}", entry.path().display());
            remove_path(&entry.path())?;
        }
    }
    Ok(())
}

fn discard(path: &Path) {
    if let Err(e) = remove_path(path) {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}
