// kiln-core/src/build/env.rs
//
// Sanitized environment for build and test steps. Only a short keep-list of
// host variables survives; everything a build tool searches (PATH, flags,
// pkg-config, cmake, Go caches) is rebuilt from the dependency prefixes.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use tracing::{debug, trace};

/// Host variables passed through unchanged.
const ENV_VARS_TO_KEEP: &[&str] = &[
    "USER",
    "LOGNAME",
    "TERM",
    "LANG",
    "LC_ALL",
    "TZ",
    "SSL_CERT_FILE",
    "SSL_CERT_DIR",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
];

const SYSTEM_PATH: &[&str] = &["/usr/bin", "/bin", "/usr/sbin", "/sbin"];

/// Where a step runs: scratch space for `HOME` and `TMPDIR`, plus the
/// directory `{prefix}` resolves to.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    pub home: PathBuf,
    pub tmp: PathBuf,
    pub prefix: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
    path_dirs: Vec<PathBuf>,
}

impl BuildEnvironment {
    /// Environment for install steps. Dependency prefixes come first on every
    /// search path, in the order given.
    pub fn for_build(
        config: &Config,
        paths: &SandboxPaths,
        dep_prefixes: &[PathBuf],
    ) -> Result<Self> {
        Self::assemble(env::vars(), config, paths, &[], dep_prefixes)
    }

    /// Environment for test steps: the installed keg's `bin` and `sbin`
    /// precede everything else.
    pub fn for_test(
        config: &Config,
        paths: &SandboxPaths,
        keg: &Path,
        dep_prefixes: &[PathBuf],
    ) -> Result<Self> {
        let own = [keg.join("bin"), keg.join("sbin")];
        Self::assemble(env::vars(), config, paths, &own, dep_prefixes)
    }

    pub(crate) fn assemble(
        host: impl IntoIterator<Item = (String, String)>,
        config: &Config,
        paths: &SandboxPaths,
        leading_dirs: &[PathBuf],
        dep_prefixes: &[PathBuf],
    ) -> Result<Self> {
        let mut vars = BTreeMap::new();
        for (key, value) in host {
            if ENV_VARS_TO_KEEP.contains(&key.as_str()) || key.starts_with("LC_") {
                trace!("Keeping env var: {}", key);
                vars.insert(key, value);
            }
        }

        // PATH: leading dirs, dependency bin/sbin, shared prefix, system.
        let mut path_dirs: Vec<PathBuf> = leading_dirs.to_vec();
        for dep in dep_prefixes {
            path_dirs.push(dep.join("bin"));
            path_dirs.push(dep.join("sbin"));
        }
        path_dirs.push(config.prefix_dir().join("bin"));
        path_dirs.push(config.prefix_dir().join("sbin"));
        path_dirs.extend(SYSTEM_PATH.iter().map(PathBuf::from));
        let mut seen = Vec::with_capacity(path_dirs.len());
        path_dirs.retain(|dir| {
            if seen.contains(dir) {
                false
            } else {
                seen.push(dir.clone());
                true
            }
        });
        vars.insert("PATH".to_string(), join_paths("PATH", &path_dirs)?);

        let home = paths.home.to_string_lossy().into_owned();
        let tmp = paths.tmp.to_string_lossy().into_owned();
        vars.insert("HOME".to_string(), home.clone());
        vars.insert("TMPDIR".to_string(), tmp.clone());
        vars.insert("TMP".to_string(), tmp.clone());
        vars.insert("TEMP".to_string(), tmp);
        vars.insert("XDG_CACHE_HOME".to_string(), format!("{home}/.cache"));

        // Go keeps module and build caches under HOME unless told otherwise.
        vars.insert("GOPATH".to_string(), format!("{home}/go"));
        vars.insert("GOCACHE".to_string(), format!("{home}/.cache/go-build"));
        vars.insert("GOTOOLCHAIN".to_string(), "local".to_string());

        let include_dirs: Vec<String> = dep_prefixes
            .iter()
            .map(|p| p.join("include"))
            .filter(|p| p.is_dir())
            .map(|p| format!("-I{}", p.display()))
            .collect();
        let lib_dirs: Vec<String> = dep_prefixes
            .iter()
            .map(|p| p.join("lib"))
            .filter(|p| p.is_dir())
            .map(|p| format!("-L{}", p.display()))
            .collect();
        if !include_dirs.is_empty() {
            vars.insert("CPPFLAGS".to_string(), include_dirs.join(" "));
        }
        if !lib_dirs.is_empty() {
            vars.insert("LDFLAGS".to_string(), lib_dirs.join(" "));
        }

        let mut pkg_config_dirs = Vec::new();
        for dep in dep_prefixes {
            pkg_config_dirs.push(dep.join("lib/pkgconfig"));
            pkg_config_dirs.push(dep.join("share/pkgconfig"));
        }
        set_path_list_var(&mut vars, "PKG_CONFIG_PATH", &pkg_config_dirs)?;
        set_path_list_var(&mut vars, "CMAKE_PREFIX_PATH", dep_prefixes)?;

        vars.insert("MAKEFLAGS".to_string(), format!("-j{}", config.jobs.max(1)));
        vars.insert(
            "KILN_PREFIX".to_string(),
            config.prefix_dir().to_string_lossy().into_owned(),
        );
        vars.insert(
            "KILN_FORMULA_PREFIX".to_string(),
            paths.prefix.to_string_lossy().into_owned(),
        );

        debug!("Build PATH: {}", vars["PATH"]);
        Ok(Self { vars, path_dirs })
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn get_var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn path_dirs(&self) -> &[PathBuf] {
        &self.path_dirs
    }

    /// Layers step-specific variables over the base environment.
    pub fn with_overrides(&self, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut vars = self.vars.clone();
        vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    /// Looks `program` up on this environment's PATH. Paths containing a
    /// separator are resolved against `cwd` instead.
    pub fn resolve_program(&self, program: &str, cwd: &Path) -> Result<PathBuf> {
        which::which_in(program, self.get_var("PATH"), cwd).map_err(|e| {
            debug!("Lookup of '{}' failed: {}", program, e);
            KilnError::NotFound(program.to_string())
        })
    }
}

fn join_paths(name: &str, dirs: &[PathBuf]) -> Result<String> {
    env::join_paths(dirs)
        .map_err(|e| KilnError::Generic(format!("Failed to join {name}: {e}")))?
        .into_string()
        .map_err(|s| KilnError::Generic(format!("{name} contains non-UTF8 characters: {s:?}")))
}

/// Sets `name` to the existing directories among `dirs`, or leaves it unset.
fn set_path_list_var(
    vars: &mut BTreeMap<String, String>,
    name: &str,
    dirs: &[PathBuf],
) -> Result<()> {
    let existing: Vec<PathBuf> = dirs.iter().filter(|p| p.is_dir()).cloned().collect();
    if !existing.is_empty() {
        vars.insert(name.to_string(), join_paths(name, &existing)?);
    }
    Ok(())
}
