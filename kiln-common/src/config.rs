// kiln-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::UserDirs;
use tracing::debug;

use super::error::{KilnError, Result};

const DEFAULT_ROOT_DIRNAME: &str = ".kiln";
const DEFAULT_FETCH_RETRIES: u32 = 3;
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Directories under the prefix that receive links to keg contents.
pub const LINKED_DIRS: &[&str] = &[
    "bin", "sbin", "lib", "include", "share", "etc", "libexec/bin",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub formula_dirs: Vec<PathBuf>,
    pub jobs: usize,
    pub fetch_retries: u32,
    pub allow_http: bool,
    pub step_timeout: Duration,
    pub test_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading kiln configuration");

        let root = match env::var("KILN_ROOT").ok().filter(|s| !s.is_empty()) {
            Some(root) => PathBuf::from(root),
            None => {
                let home = UserDirs::new()
                    .map(|ud| ud.home_dir().to_path_buf())
                    .ok_or_else(|| {
                        KilnError::Config(
                            "KILN_ROOT is not set and no home directory could be determined"
                                .to_string(),
                        )
                    })?;
                debug!("KILN_ROOT not set, using default under {}", home.display());
                home.join(DEFAULT_ROOT_DIRNAME)
            }
        };

        let mut config = Self::with_root(&root);

        if let Some(path) = env::var_os("KILN_FORMULA_PATH").filter(|s| !s.is_empty()) {
            config.formula_dirs = env::split_paths(&path).collect();
        }
        if let Some(jobs) = read_number::<usize>("KILN_JOBS")? {
            config.jobs = jobs.max(1);
        }
        if let Some(retries) = read_number::<u32>("KILN_FETCH_RETRIES")? {
            config.fetch_retries = retries;
        }
        if let Some(timeout) = env::var("KILN_STEP_TIMEOUT").ok().filter(|s| !s.is_empty()) {
            config.step_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                KilnError::Config(format!("KILN_STEP_TIMEOUT '{timeout}' is invalid: {e}"))
            })?;
        }
        config.allow_http = env::var("KILN_ALLOW_HTTP").is_ok_and(|v| v == "1" || v == "true");

        debug!("Effective KILN_ROOT set to: {}", config.root.display());
        Ok(config)
    }

    /// A configuration rooted at `root` with defaults for everything else.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            formula_dirs: vec![root.join("formulae")],
            root,
            jobs: default_jobs(),
            fetch_retries: DEFAULT_FETCH_RETRIES,
            allow_http: false,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            test_timeout: DEFAULT_TEST_TIMEOUT,
        }
    }

    /// Moves all state below `root`. Formula directories follow the root
    /// unless they were configured explicitly.
    pub fn relocate(&mut self, root: impl AsRef<Path>) {
        let root = root.as_ref().to_path_buf();
        if self.formula_dirs == [self.root.join("formulae")] {
            self.formula_dirs = vec![root.join("formulae")];
        }
        debug!("Relocating KILN_ROOT to {}", root.display());
        self.root = root;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.root.join("Cellar")
    }

    /// The shared prefix. Holds symlinks only.
    pub fn prefix_dir(&self) -> PathBuf {
        self.root.join("prefix")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.prefix_dir().join("bin")
    }

    pub fn opt_dir(&self) -> PathBuf {
        self.prefix_dir().join("opt")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir().join("downloads")
    }

    pub fn receipts_dir(&self) -> PathBuf {
        self.root.join("var").join("receipts")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("var").join("locks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("var").join("log")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn formula_cellar_dir(&self, formula_name: &str) -> PathBuf {
        self.cellar_dir().join(formula_name)
    }

    pub fn formula_keg_path(&self, formula_name: &str, version_str: &str) -> PathBuf {
        self.formula_cellar_dir(formula_name).join(version_str)
    }

    pub fn formula_opt_path(&self, formula_name: &str) -> PathBuf {
        self.opt_dir().join(formula_name)
    }

    pub fn formula_receipts_dir(&self, formula_name: &str) -> PathBuf {
        self.receipts_dir().join(formula_name)
    }

    pub fn receipt_path(&self, formula_name: &str, version_str: &str) -> PathBuf {
        self.formula_receipts_dir(formula_name)
            .join(format!("{version_str}.json"))
    }

    pub fn formula_lock_path(&self, formula_name: &str) -> PathBuf {
        self.locks_dir().join(format!("{formula_name}.lock"))
    }
}

/// Physical cores minus one, between 1 and 6.
pub fn default_jobs() -> usize {
    std::cmp::max(1, num_cpus::get_physical().saturating_sub(1)).min(6)
}

fn read_number<T: std::str::FromStr>(var: &str) -> Result<Option<T>> {
    match env::var(var).ok().filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| KilnError::Config(format!("{var} must be a number, got '{raw}'"))),
        None => Ok(None),
    }
}
