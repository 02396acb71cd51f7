// kiln-common/src/formulary.rs
// The index of available formulae, read from the configured formula directories.
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use super::config::Config;
use super::error::{KilnError, Result};
use super::model::formula::{Formula, FormulaFormat};

#[derive(Debug, Default)]
pub struct Formulary {
    formulae: HashMap<String, Arc<Formula>>,
    // Files that failed to load, keyed by file stem. Reported only when asked for.
    broken: HashMap<String, KilnError>,
}

impl Formulary {
    pub fn load(config: &Config) -> Result<Self> {
        Self::from_dirs(&config.formula_dirs)
    }

    /// Loads every `*.toml` / `*.json` file in `dirs`. The first directory that
    /// provides a name wins.
    pub fn from_dirs(dirs: &[PathBuf]) -> Result<Self> {
        let mut formulary = Formulary::default();
        for dir in dirs {
            if !dir.is_dir() {
                debug!("Formula directory {} does not exist, skipping", dir.display());
                continue;
            }
            let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && FormulaFormat::from_path(p).is_some())
                .collect();
            paths.sort();

            for path in paths {
                let stem = match path.file_stem().and_then(|s| s.to_str()) {
                    Some(stem) => stem.to_string(),
                    None => continue,
                };
                if formulary.formulae.contains_key(&stem) || formulary.broken.contains_key(&stem)
                {
                    warn!(
                        "Ignoring {}: formula '{}' is already provided by an earlier directory",
                        path.display(),
                        stem
                    );
                    continue;
                }
                match Formula::from_path(&path) {
                    Ok(formula) => {
                        if formula.name != stem {
                            warn!(
                                "Formula file {} declares name '{}', not '{}'",
                                path.display(),
                                formula.name,
                                stem
                            );
                        }
                        formulary
                            .formulae
                            .entry(formula.name.clone())
                            .or_insert_with(|| Arc::new(formula));
                    }
                    Err(e) => {
                        debug!("Failed to load {}: {}", path.display(), e);
                        formulary.broken.insert(stem, e);
                    }
                }
            }
        }
        debug!(
            "Loaded {} formulae ({} unreadable)",
            formulary.formulae.len(),
            formulary.broken.len()
        );
        Ok(formulary)
    }

    /// Builds an index from already parsed formulae.
    pub fn from_formulae(formulae: impl IntoIterator<Item = Formula>) -> Self {
        Self {
            formulae: formulae
                .into_iter()
                .map(|f| (f.name.clone(), Arc::new(f)))
                .collect(),
            broken: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<Formula>> {
        if let Some(formula) = self.formulae.get(name) {
            return Ok(Arc::clone(formula));
        }
        if let Some(err) = self.broken.get(name) {
            return Err(err.clone());
        }
        Err(KilnError::UnknownFormula(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formulae.contains_key(name) || self.broken.contains_key(name)
    }

    /// Names of all loadable formulae, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.formulae.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.formulae.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulae.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const TOOL: &str = r#"
name = "tool"
version = "1.0"
desc = "A tool"
homepage = "https://example.com"
url = "https://example.com/tool-1.0.tar.gz"
sha256 = "1111111111111111111111111111111111111111111111111111111111111111"
license = "MIT"
test = []

[[install]]
type = "shell"
script = "true"
"#;

    #[test]
    fn loads_directories_and_defers_broken_files() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        fs::write(first.path().join("tool.toml"), TOOL).unwrap();
        fs::write(first.path().join("broken.toml"), "name = \"broken\"\n").unwrap();
        fs::write(first.path().join("README.md"), "not a formula").unwrap();
        fs::write(
            second.path().join("tool.toml"),
            TOOL.replace("version = \"1.0\"", "version = \"9.9\""),
        )
        .unwrap();

        let formulary =
            Formulary::from_dirs(&[first.path().to_path_buf(), second.path().to_path_buf()])
                .unwrap();

        assert_eq!(formulary.names(), vec!["tool"]);
        assert_eq!(formulary.get("tool").unwrap().version, "1.0");
        assert!(matches!(
            formulary.get("broken"),
            Err(KilnError::MalformedFormula { .. })
        ));
        assert!(matches!(
            formulary.get("missing"),
            Err(KilnError::UnknownFormula(_))
        ));
    }
}
