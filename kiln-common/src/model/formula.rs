// kiln-common/src/model/formula.rs
// A formula is a recipe for building one tool from source: where to fetch it,
// what it needs, how to build it and how to check the result.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::step::Step;
use super::template::{placeholders, Placeholder, STD_GO_ARGS};
use crate::dependency::{Dependency, DependencyExt, DependencyKind};
use crate::error::{KilnError, Result};

const ARCHIVE_SUFFIXES: &[&str] = &[
    ".tar.gz", ".tgz", ".tar.xz", ".txz", ".tar.bz2", ".tbz2", ".tbz", ".tar", ".zip", ".gz",
    ".xz", ".bz2",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormulaFormat {
    Toml,
    Json,
}

impl FormulaFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Some(FormulaFormat::Toml),
            Some("json") => Some(FormulaFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Formula {
    pub name: String,
    pub version: String,
    pub desc: String,
    pub homepage: String,
    /// Source download URL
    pub url: String,
    /// SHA256 checksum for the source archive, lowercase hex
    pub sha256: String,
    pub license: String,
    /// Declared dependencies, in declaration order.
    pub dependencies: Vec<Dependency>,
    /// Named flags referenced by steps as `{flag:NAME}`.
    pub flags: BTreeMap<String, String>,
    pub install: Vec<Step>,
    pub test: Vec<Step>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Name(String),
    Spec {
        name: String,
        #[serde(default)]
        kind: DependencyKind,
    },
}

impl From<RawDependency> for Dependency {
    fn from(raw: RawDependency) -> Self {
        match raw {
            RawDependency::Name(name) => Dependency::new_runtime(name),
            RawDependency::Spec { name, kind } => Dependency::new_with_tags(name, kind.into()),
        }
    }
}

// Required fields are optional here so a missing one is reported as a
// malformed formula naming the field, not as a generic parse failure.
#[derive(Deserialize)]
struct RawFormula {
    name: Option<String>,
    version: Option<String>,
    desc: Option<String>,
    homepage: Option<String>,
    url: Option<String>,
    sha256: Option<String>,
    license: Option<String>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
    #[serde(default)]
    flags: BTreeMap<String, String>,
    install: Option<Vec<Step>>,
    test: Option<Vec<Step>>,
}

fn required(value: Option<String>, field: &str, name: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| KilnError::malformed(name, format!("missing required field '{field}'")))
}

impl Formula {
    /// Parses and validates formula source text. `origin` names the formula in
    /// errors raised before its own `name` field is known.
    pub fn parse(text: &str, format: FormulaFormat, origin: &str) -> Result<Self> {
        let raw: RawFormula = match format {
            FormulaFormat::Toml => {
                toml::from_str(text).map_err(|e| KilnError::malformed(origin, e.to_string()))?
            }
            FormulaFormat::Json => serde_json::from_str(text)
                .map_err(|e| KilnError::malformed(origin, e.to_string()))?,
        };

        let name = required(raw.name, "name", origin)?;
        let url = required(raw.url, "url", &name)?;
        let version = match raw.version.filter(|v| !v.trim().is_empty()) {
            Some(v) => v,
            None => version_from_url(&url).ok_or_else(|| {
                KilnError::malformed(
                    &name,
                    format!("no 'version' given and none could be detected from '{url}'"),
                )
            })?,
        };

        let formula = Formula {
            desc: required(raw.desc, "desc", &name)?,
            homepage: required(raw.homepage, "homepage", &name)?,
            sha256: required(raw.sha256, "sha256", &name)?.to_ascii_lowercase(),
            license: required(raw.license, "license", &name)?,
            install: raw
                .install
                .ok_or_else(|| KilnError::malformed(&name, "missing required field 'install'"))?,
            test: raw
                .test
                .ok_or_else(|| KilnError::malformed(&name, "missing required field 'test'"))?,
            dependencies: raw.dependencies.into_iter().map(Dependency::from).collect(),
            flags: raw.flags,
            name,
            version,
            url,
        };
        formula.validate()?;
        debug!(
            "Parsed formula '{}' {} with {} dependencies",
            formula.name,
            formula.version,
            formula.dependencies.len()
        );
        Ok(formula)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let origin = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("<unknown>")
            .to_string();
        let format = FormulaFormat::from_path(path).ok_or_else(|| {
            KilnError::malformed(&origin, format!("unsupported formula file {}", path.display()))
        })?;
        let text = fs::read_to_string(path)?;
        Self::parse(&text, format, &origin)
    }

    pub fn dependency(&self, name: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.name == name)
    }

    /// Static checks run before any step executes.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(KilnError::malformed(&self.name, reason));

        if !is_safe_segment(&self.name) {
            return fail(format!("invalid formula name '{}'", self.name));
        }
        if !is_safe_segment(&self.version) {
            return fail(format!("invalid version '{}'", self.version));
        }
        if self.sha256.len() != 64 || !self.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return fail(format!(
                "sha256 must be 64 hex characters, got '{}'",
                self.sha256
            ));
        }
        match url::Url::parse(&self.url) {
            Ok(u) if matches!(u.scheme(), "https" | "http" | "file") => {}
            Ok(u) => return fail(format!("unsupported url scheme '{}'", u.scheme())),
            Err(e) => return fail(format!("invalid url '{}': {e}", self.url)),
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if !is_safe_segment(&dep.name) {
                return fail(format!("invalid dependency name '{}'", dep.name));
            }
            if !seen.insert(dep.name.as_str()) {
                return fail(format!("dependency '{}' declared twice", dep.name));
            }
        }

        if self.install.is_empty() {
            return fail("install procedure has no steps".to_string());
        }
        for (i, step) in self.install.iter().enumerate() {
            self.validate_step("install", i + 1, step, false)?;
        }
        for (i, step) in self.test.iter().enumerate() {
            self.validate_step("test", i + 1, step, true)?;
        }
        Ok(())
    }

    fn validate_step(&self, section: &str, index: usize, step: &Step, in_test: bool) -> Result<()> {
        let fail = |reason: String| {
            Err(KilnError::malformed(
                &self.name,
                format!("{section} step {index} ({}): {reason}", step.kind()),
            ))
        };

        match step {
            Step::Run { program, env, .. } => {
                if program.trim().is_empty() {
                    return fail("empty program".to_string());
                }
                if let Some(key) = env.keys().find(|k| k.is_empty() || k.contains('=')) {
                    return fail(format!("invalid environment variable name '{key}'"));
                }
            }
            Step::Shell { script } => {
                if script.trim().is_empty() {
                    return fail("empty script".to_string());
                }
            }
            Step::AssertOutput {
                program,
                status,
                contains,
                matches,
                ..
            } => {
                if program.trim().is_empty() {
                    return fail("empty program".to_string());
                }
                if status.is_none() && contains.is_none() && matches.is_none() {
                    return fail("needs at least one of status, contains, matches".to_string());
                }
                if let Some(pattern) = matches {
                    if let Err(e) = Regex::new(pattern) {
                        return fail(format!("invalid pattern '{pattern}': {e}"));
                    }
                }
            }
            Step::AssertExists { path } => {
                let p = Path::new(path);
                if path.trim().is_empty()
                    || p.is_absolute()
                    || p.components().any(|c| c.as_os_str() == "..")
                {
                    return fail(format!("path '{path}' must be relative to the prefix"));
                }
            }
        }

        let program = match step {
            Step::Run { program, .. } | Step::AssertOutput { program, .. } => Some(program),
            _ => None,
        };
        let whole_args_allowed = matches!(step, Step::Run { .. } | Step::AssertOutput { .. });

        for template in step.templates() {
            let found = match placeholders(template) {
                Ok(found) => found,
                Err(e) => return fail(e),
            };
            for placeholder in found {
                match placeholder {
                    Placeholder::Flag(flag) if !self.flags.contains_key(&flag) => {
                        return fail(format!("flag '{flag}' is not declared"));
                    }
                    Placeholder::Opt(dep) if self.dependency(&dep).is_none() => {
                        return fail(format!("'{{opt:{dep}}}' names an undeclared dependency"));
                    }
                    Placeholder::Buildpath if in_test => {
                        return fail("{buildpath} is not available in tests".to_string());
                    }
                    Placeholder::StdGoArgs
                        if !whole_args_allowed
                            || template.trim() != STD_GO_ARGS
                            || program.is_some_and(|p| p.as_str() == template) =>
                    {
                        return fail("{std_go_args} must be a whole argument".to_string());
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    pub fn runtime_dependencies(&self) -> Vec<&Dependency> {
        self.dependencies.runtime()
    }
}

/// Names and versions become path components below the cellar.
pub fn is_safe_segment(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && !s.starts_with('.')
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+' | '@'))
}

/// Derives a version from a source URL, e.g. `.../v0.1.0.tar.gz` gives `0.1.0`.
pub fn version_from_url(url: &str) -> Option<String> {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    let basename = path.trim_end_matches('/').rsplit('/').next()?;
    let stem = ARCHIVE_SUFFIXES
        .iter()
        .find_map(|suffix| basename.strip_suffix(suffix))
        .unwrap_or(basename);

    let dotted = Regex::new(r"\d+(?:\.\d+)+(?:[-_.]?(?:alpha|beta|rc|pre)\.?\d*)?").ok()?;
    if let Some(m) = dotted.find_iter(stem).last() {
        return Some(m.as_str().to_string());
    }
    let single = Regex::new(r"(?:^|[-_])v?(\d+)$").ok()?;
    single
        .captures(stem)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::DependencyTag;

    pub(crate) const GUISE_TOML: &str = r#"
name = "guise"
desc = "Switch between multiple identities"
homepage = "https://github.com/jagtesh/guise"
url = "https://github.com/jagtesh/guise/archive/refs/tags/v0.1.0.tar.gz"
sha256 = "0000000000000000000000000000000000000000000000000000000000000000"
license = "BSD-3-Clause"
livecheck = { url = "ignored" }

[[dependencies]]
name = "go"
kind = "build"

[flags]
ldflags = "-s -w"

[[install]]
type = "run"
program = "go"
args = ["build", "{std_go_args}"]

[[test]]
type = "assert_output"
program = "{bin}/guise"
args = ["--help"]
status = 1
contains = "Guise"
"#;

    #[test]
    fn parses_guise_formula() {
        let f = Formula::parse(GUISE_TOML, FormulaFormat::Toml, "guise").unwrap();
        assert_eq!(f.name, "guise");
        assert_eq!(f.version, "0.1.0");
        assert_eq!(f.license, "BSD-3-Clause");
        assert_eq!(f.dependencies.len(), 1);
        assert_eq!(f.dependencies[0].name, "go");
        assert_eq!(f.dependencies[0].tags, DependencyTag::BUILD);
        assert_eq!(f.flags.get("ldflags").map(String::as_str), Some("-s -w"));
        assert_eq!(f.install.len(), 1);
        assert!(matches!(
            &f.test[0],
            Step::AssertOutput { status: Some(1), contains: Some(c), .. } if c == "Guise"
        ));
    }

    #[test]
    fn parses_json_with_shorthand_dependencies() {
        let json = r#"{
            "name": "tool", "version": "2.0", "desc": "d", "homepage": "https://example.com",
            "url": "https://example.com/tool-2.0.tar.gz",
            "sha256": "ABCDEF0000000000000000000000000000000000000000000000000000000000",
            "license": "MIT", "dependencies": ["libfoo", {"name": "make", "kind": "build"}],
            "install": [{"type": "shell", "script": "make install PREFIX={prefix}"}],
            "test": []
        }"#;
        let f = Formula::parse(json, FormulaFormat::Json, "tool").unwrap();
        assert_eq!(f.dependencies[0].tags, DependencyTag::RUNTIME);
        assert_eq!(f.dependencies[1].tags, DependencyTag::BUILD);
        assert!(f.sha256.starts_with("abcdef"));
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let text = GUISE_TOML.replace("license = \"BSD-3-Clause\"\n", "");
        let err = Formula::parse(&text, FormulaFormat::Toml, "guise").unwrap_err();
        match err {
            KilnError::MalformedFormula { name, reason } => {
                assert_eq!(name, "guise");
                assert!(reason.contains("license"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn undeclared_flag_fails_validation() {
        let text = GUISE_TOML.replace("[flags]\nldflags = \"-s -w\"\n", "").replace(
            "args = [\"build\", \"{std_go_args}\"]",
            "args = [\"build\", \"-ldflags={flag:ldflags}\"]",
        );
        let err = Formula::parse(&text, FormulaFormat::Toml, "guise").unwrap_err();
        assert!(err.to_string().contains("flag 'ldflags' is not declared"));
    }

    #[test]
    fn bad_regex_and_empty_assertions_fail_validation() {
        let text = GUISE_TOML.replace("contains = \"Guise\"", "matches = \"(unclosed\"");
        assert!(Formula::parse(&text, FormulaFormat::Toml, "guise").is_err());

        let text = GUISE_TOML
            .replace("status = 1\n", "")
            .replace("contains = \"Guise\"\n", "");
        assert!(Formula::parse(&text, FormulaFormat::Toml, "guise").is_err());
    }

    #[test]
    fn buildpath_is_rejected_in_tests() {
        let text = GUISE_TOML.replace("args = [\"--help\"]", "args = [\"{buildpath}\"]");
        let err = Formula::parse(&text, FormulaFormat::Toml, "guise").unwrap_err();
        assert!(err.to_string().contains("buildpath"));
    }

    #[test]
    fn detects_versions_from_urls() {
        assert_eq!(
            version_from_url("https://github.com/jagtesh/guise/archive/refs/tags/v0.1.0.tar.gz")
                .as_deref(),
            Some("0.1.0")
        );
        assert_eq!(
            version_from_url("https://example.com/dl/foo-1.2.3.tar.xz").as_deref(),
            Some("1.2.3")
        );
        assert_eq!(
            version_from_url("https://example.com/dl/foo-2.0-rc1.zip").as_deref(),
            Some("2.0-rc1")
        );
        assert_eq!(
            version_from_url("https://example.com/dl/bar-7.tgz").as_deref(),
            Some("7")
        );
        assert_eq!(version_from_url("https://example.com/dl/latest.tar.gz"), None);
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(is_safe_segment("guise"));
        assert!(is_safe_segment("openssl@3"));
        assert!(!is_safe_segment("../etc"));
        assert!(!is_safe_segment("a/b"));
        assert!(!is_safe_segment(".hidden"));
    }
}
