// kiln-core/src/install/link.rs
//
// Prefix links: planning, conflict detection, journaled application and
// removal. The prefix holds symlinks only; every link points into exactly one
// keg under the cellar.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use kiln_aio::fs::{is_symlink, prune_empty_parents, remove_path, replace_symlink};
use kiln_common::config::{Config, LINKED_DIRS};
use kiln_common::error::{KilnError, Result};
use kiln_common::receipt::InstalledReceipt;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedLink {
    /// Link location relative to the prefix, as recorded in the receipt.
    pub rel: PathBuf,
    pub link: PathBuf,
    pub target: PathBuf,
}

/// Who a path in the prefix currently belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOwner {
    Missing,
    /// A link into some version of the formula being linked.
    Same,
    /// A link into another formula's kegs.
    Formula(String),
    /// A regular file, a directory, or a link pointing outside the cellar.
    Foreign,
}

/// Target of the symlink at `link`, made absolute.
fn link_target(link: &Path) -> Option<PathBuf> {
    let target = fs::read_link(link).ok()?;
    if target.is_absolute() {
        Some(target)
    } else {
        Some(link.parent()?.join(target))
    }
}

pub fn link_points_into(link: &Path, dir: &Path) -> bool {
    is_symlink(link) && link_target(link).is_some_and(|t| t.starts_with(dir))
}

pub fn link_owner(config: &Config, name: &str, link: &Path) -> LinkOwner {
    let Ok(meta) = link.symlink_metadata() else {
        return LinkOwner::Missing;
    };
    if !meta.file_type().is_symlink() {
        return LinkOwner::Foreign;
    }
    let Some(target) = link_target(link) else {
        return LinkOwner::Foreign;
    };
    if target.starts_with(config.formula_cellar_dir(name)) {
        return LinkOwner::Same;
    }
    match target.strip_prefix(config.cellar_dir()) {
        Ok(rest) => rest
            .components()
            .next()
            .map(|c| LinkOwner::Formula(c.as_os_str().to_string_lossy().into_owned()))
            .unwrap_or(LinkOwner::Foreign),
        Err(_) => LinkOwner::Foreign,
    }
}

/// Links for every file below the linked directories of `contents`, aimed at
/// the same relative path under `keg`, plus `opt/<name>` for the keg itself.
/// `contents` may be a staging copy of what will become `keg`.
pub fn plan_links(
    config: &Config,
    name: &str,
    contents: &Path,
    keg: &Path,
) -> Result<Vec<PlannedLink>> {
    let prefix = config.prefix_dir();
    let mut plan = Vec::new();
    for dir in LINKED_DIRS {
        let source_dir = contents.join(dir);
        if !source_dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&source_dir).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| {
                KilnError::Install(format!("Failed to scan {}: {e}", source_dir.display()))
            })?;
            if entry.file_type().is_dir() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(contents)
                .map_err(|e| KilnError::Install(e.to_string()))?
                .to_path_buf();
            if rel
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            {
                continue;
            }
            plan.push(PlannedLink {
                link: prefix.join(&rel),
                target: keg.join(&rel),
                rel,
            });
        }
    }
    let opt_rel = PathBuf::from("opt").join(name);
    plan.push(PlannedLink {
        link: prefix.join(&opt_rel),
        target: keg.to_path_buf(),
        rel: opt_rel,
    });
    plan.sort_by(|a, b| a.rel.cmp(&b.rel));
    debug!("[LINK:{}] planned {} link(s)", name, plan.len());
    Ok(plan)
}

/// Fails without touching anything if a planned link would replace a path
/// that is not a link into this formula's own kegs.
pub fn check_conflicts(config: &Config, name: &str, plan: &[PlannedLink]) -> Result<()> {
    let conflicts: Vec<String> = plan
        .iter()
        .filter_map(|p| match link_owner(config, name, &p.link) {
            LinkOwner::Missing | LinkOwner::Same => None,
            LinkOwner::Formula(other) => Some(format!("{} (linked by {other})", p.rel.display())),
            LinkOwner::Foreign => Some(format!("{} (not managed by kiln)", p.rel.display())),
        })
        .collect();
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(KilnError::Install(format!(
            "Cannot link {name}; these prefix paths are in the way: {}",
            conflicts.join(", ")
        )))
    }
}

/// Records what every applied link replaced so the change can be undone.
#[derive(Debug, Default)]
pub struct LinkJournal {
    prefix: PathBuf,
    applied: Vec<(PathBuf, Option<PathBuf>)>,
}

impl LinkJournal {
    pub fn new(config: &Config) -> Self {
        Self {
            prefix: config.prefix_dir(),
            applied: Vec::new(),
        }
    }

    /// Applies `plan` in order, journaling each replacement. Stops at the
    /// first failure; the caller decides whether to roll back.
    pub fn apply(&mut self, plan: &[PlannedLink]) -> Result<()> {
        for planned in plan {
            let previous = if is_symlink(&planned.link) {
                fs::read_link(&planned.link).ok()
            } else {
                None
            };
            replace_symlink(&planned.target, &planned.link)?;
            self.applied.push((planned.link.clone(), previous));
        }
        Ok(())
    }

    /// Restores every journaled link to what it was before, newest first.
    pub fn rollback(self) {
        for (link, previous) in self.applied.into_iter().rev() {
            let restored = match &previous {
                Some(target) => replace_symlink(target, &link),
                None => remove_path(&link).map(|_| prune_empty_parents(&link, &self.prefix)),
            };
            if let Err(e) = restored {
                warn!("Rollback could not restore {}: {}", link.display(), e);
            }
        }
    }
}

/// Removes links recorded in `receipt` that still point into its keg,
/// except those listed in `keep`. Returns how many were removed.
pub fn remove_links(config: &Config, receipt: &InstalledReceipt, keep: &HashSet<PathBuf>) -> usize {
    let prefix = config.prefix_dir();
    let keg = receipt.keg_path(config);
    let mut removed = 0;
    for rel in &receipt.links {
        if keep.contains(rel) {
            continue;
        }
        let link = prefix.join(rel);
        if !link_points_into(&link, &keg) {
            debug!(
                "[LINK:{}] {} no longer points into {}",
                receipt.name,
                link.display(),
                keg.display()
            );
            continue;
        }
        match remove_path(&link) {
            Ok(()) => {
                prune_empty_parents(&link, &prefix);
                removed += 1;
            }
            Err(e) => warn!("Failed to remove link {}: {}", link.display(), e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use tempfile::TempDir;

    use super::*;

    fn keg_with(config: &Config, name: &str, version: &str, files: &[&str]) -> PathBuf {
        let keg = config.formula_keg_path(name, version);
        for f in files {
            let path = keg.join(f);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, f).unwrap();
        }
        keg
    }

    #[test]
    fn plans_linked_dirs_and_opt() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_root(dir.path());
        let keg = keg_with(
            &config,
            "guise",
            "0.1.0",
            &["bin/guise", "share/man/man1/guise.1", "README.md", "libexec/helper"],
        );
        let plan = plan_links(&config, "guise", &keg, &keg).unwrap();
        let rels: Vec<_> = plan.iter().map(|p| p.rel.clone()).collect();
        assert_eq!(
            rels,
            vec![
                PathBuf::from("bin/guise"),
                PathBuf::from("opt/guise"),
                PathBuf::from("share/man/man1/guise.1"),
            ]
        );
        assert_eq!(plan[1].target, keg);
    }

    #[test]
    fn conflicts_leave_the_prefix_alone() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_root(dir.path());
        let keg = keg_with(&config, "guise", "0.1.0", &["bin/guise", "bin/other-tool"]);
        let other = keg_with(&config, "other", "1.0", &["bin/other-tool"]);
        fs::create_dir_all(config.bin_dir()).unwrap();
        symlink(other.join("bin/other-tool"), config.bin_dir().join("other-tool")).unwrap();
        fs::write(config.bin_dir().join("guise"), "stray").unwrap();

        let plan = plan_links(&config, "guise", &keg, &keg).unwrap();
        let err = check_conflicts(&config, "guise", &plan).unwrap_err().to_string();
        assert!(err.contains("bin/guise (not managed by kiln)"));
        assert!(err.contains("bin/other-tool (linked by other)"));
        assert_eq!(fs::read_to_string(config.bin_dir().join("guise")).unwrap(), "stray");
    }

    #[test]
    fn rollback_restores_previous_links() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_root(dir.path());
        let old = keg_with(&config, "guise", "0.1.0", &["bin/guise"]);
        let new = keg_with(&config, "guise", "0.2.0", &["bin/guise", "bin/guise-extra"]);

        let mut first = LinkJournal::new(&config);
        first.apply(&plan_links(&config, "guise", &old, &old).unwrap()).unwrap();

        let plan = plan_links(&config, "guise", &new, &new).unwrap();
        check_conflicts(&config, "guise", &plan).unwrap();
        let mut journal = LinkJournal::new(&config);
        journal.apply(&plan).unwrap();
        assert_eq!(fs::read_link(config.bin_dir().join("guise")).unwrap(), new.join("bin/guise"));

        journal.rollback();
        assert_eq!(fs::read_link(config.bin_dir().join("guise")).unwrap(), old.join("bin/guise"));
        assert_eq!(fs::read_link(config.formula_opt_path("guise")).unwrap(), old);
        assert!(config.bin_dir().join("guise-extra").symlink_metadata().is_err());
    }
}
