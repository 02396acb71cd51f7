// kiln-core/src/verify.rs
// Self-test runner: executes a formula's test steps against its installed keg.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kiln_aio::process::run_captured;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::{Formula, TemplateContext};
use kiln_common::pipeline::{PipelineEvent, Procedure};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::build::{BuildEnvironment, DependencyPrefixes, SandboxPaths};
use crate::step::{PreparedStep, StepContext};
use crate::{emit, EventSender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub formula: String,
    pub version: String,
    pub steps_run: usize,
    /// One entry per failed step, prefixed with the step number.
    pub failures: Vec<String>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// The [`KilnError::Verification`] a failed report stands for.
    pub fn error(&self) -> Option<KilnError> {
        if self.passed() {
            return None;
        }
        Some(KilnError::Verification(format!(
            "{} {}: {}",
            self.formula,
            self.version,
            self.failures.join("; ")
        )))
    }
}

/// Runs every test step of `formula` with `{prefix}` bound to `keg` and the
/// keg's `bin` first on `PATH`. All steps run even after a failure so the
/// report lists every unmet assertion. Only cancellation and sandbox setup
/// problems are returned as errors.
#[instrument(skip_all, fields(formula = %formula.name))]
pub async fn run_self_test(
    config: &Config,
    formula: &Formula,
    keg: &Path,
    deps: &DependencyPrefixes,
    cancel: &CancellationToken,
    events: &EventSender,
) -> Result<VerificationReport> {
    let mut report = VerificationReport {
        formula: formula.name.clone(),
        version: formula.version.clone(),
        steps_run: 0,
        failures: Vec::new(),
    };
    if formula.test.is_empty() {
        warn!("{} declares no test steps", formula.name);
        return Ok(report);
    }

    tokio::fs::create_dir_all(config.tmp_dir()).await?;
    let workdir = tempfile::Builder::new()
        .prefix(&format!("kiln-test-{}-", formula.name))
        .tempdir_in(config.tmp_dir())?;
    let paths = SandboxPaths {
        home: workdir.path().join("home"),
        tmp: workdir.path().join("tmp"),
        prefix: keg.to_path_buf(),
    };
    for dir in [&paths.home, &paths.tmp] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let dep_prefixes: Vec<PathBuf> = deps.iter().map(|(_, p)| p.clone()).collect();
    let opt_paths: HashMap<String, PathBuf> = deps.iter().cloned().collect();
    let env = BuildEnvironment::for_test(config, &paths, keg, &dep_prefixes)?;
    let template = TemplateContext {
        name: &formula.name,
        version: &formula.version,
        prefix: keg,
        buildpath: None,
        flags: &formula.flags,
        opt_paths: &opt_paths,
    };
    let ctx = StepContext {
        template: &template,
        env: &env,
        cwd: workdir.path(),
        timeout: Some(config.test_timeout),
    };

    for (offset, step) in formula.test.iter().enumerate() {
        let index = offset + 1;
        let prepared = match ctx.prepare(step) {
            Ok(prepared) => prepared,
            Err(KilnError::NotFound(program)) => {
                report.failures.push(format!("step {index}: {program} not found"));
                continue;
            }
            Err(e) => return Err(e),
        };
        let command = prepared.describe();
        emit(
            events,
            PipelineEvent::StepStarted {
                formula: formula.name.clone(),
                procedure: Procedure::Test,
                index,
                command: command.clone(),
            },
        );
        let failures = check_step(&prepared, cancel).await?;
        report.steps_run += 1;
        emit(
            events,
            PipelineEvent::StepFinished {
                formula: formula.name.clone(),
                procedure: Procedure::Test,
                index,
                success: failures.is_empty(),
            },
        );
        if !failures.is_empty() {
            debug!("Test step {} (`{}`) failed: {:?}", index, command, failures);
            report
                .failures
                .push(format!("step {index} (`{command}`): {}", failures.join(", ")));
        }
    }

    if let Err(e) = workdir.close() {
        warn!("Failed to remove test sandbox: {}", e);
    }
    Ok(report)
}

async fn check_step(prepared: &PreparedStep, cancel: &CancellationToken) -> Result<Vec<String>> {
    match prepared {
        PreparedStep::Exists { path } => Ok(if path.symlink_metadata().is_ok() {
            Vec::new()
        } else {
            vec![format!("{} does not exist", path.display())]
        }),
        PreparedStep::Command { spec, expect } => {
            let outcome = match run_captured(spec, cancel).await {
                Ok(outcome) => outcome,
                Err(KilnError::Io(e)) => return Ok(vec![format!("failed to start: {e}")]),
                Err(e) => return Err(e),
            };
            Ok(match expect {
                Some(expect) => expect.check(&outcome),
                None if outcome.success() => Vec::new(),
                None => vec![outcome.describe_status()],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use kiln_common::model::formula::FormulaFormat;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    use super::*;

    const GUISE: &str = "#!/bin/sh\n\
        echo 'Guise - manage git identities'\n\
        echo 'Usage: guise <command>'\n\
        exit 1\n";

    fn keg_with_binary(config: &Config, script: &str) -> PathBuf {
        let keg = config.formula_keg_path("guise", "0.1.0");
        fs::create_dir_all(keg.join("bin")).unwrap();
        let bin = keg.join("bin/guise");
        fs::write(&bin, script).unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
        keg
    }

    fn formula(top: &str, tests: &str) -> Formula {
        let text = format!(
            r#"
name = "guise"
version = "0.1.0"
desc = "d"
homepage = "https://github.com/jagtesh/guise"
url = "https://example.com/guise-0.1.0.tar.gz"
sha256 = "{}"
license = "MIT"
{top}

[[install]]
type = "shell"
script = "true"
{tests}
"#,
            "d".repeat(64)
        );
        Formula::parse(&text, FormulaFormat::Toml, "guise").unwrap()
    }

    const HELP_TEST: &str = r#"
[[test]]
type = "assert_output"
program = "guise"
args = ["--help"]
status = 1
contains = "Guise"

[[test]]
type = "assert_exists"
path = "bin/guise"
"#;

    #[tokio::test]
    async fn help_output_with_status_one_verifies() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_root(dir.path());
        let keg = keg_with_binary(&config, GUISE);
        let (tx, _rx) = broadcast::channel(16);

        let formula = formula("", HELP_TEST);
        let token = CancellationToken::new();
        let report = run_self_test(&config, &formula, &keg, &Vec::new(), &token, &tx)
            .await
            .unwrap();
        assert!(report.passed(), "{:?}", report.failures);
        assert_eq!(report.steps_run, 2);
        assert_eq!(fs::read_dir(config.tmp_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_help_text_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_root(dir.path());
        let keg = keg_with_binary(&config, "#!/bin/sh\necho usage\nexit 1\n");
        let (tx, _rx) = broadcast::channel(16);

        let formula = formula("", HELP_TEST);
        let token = CancellationToken::new();
        let report = run_self_test(&config, &formula, &keg, &Vec::new(), &token, &tx)
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].contains("does not contain \"Guise\""));
        let err = report.error().unwrap();
        assert_eq!(err.exit_code(), 7);
        assert!(err.to_string().contains("guise 0.1.0"), "{err}");
    }

    #[tokio::test]
    async fn formula_without_tests_passes_trivially() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_root(dir.path());
        let keg = keg_with_binary(&config, GUISE);
        let (tx, _rx) = broadcast::channel(16);
        let formula = formula("test = []", "");
        let token = CancellationToken::new();
        let report = run_self_test(&config, &formula, &keg, &Vec::new(), &token, &tx)
            .await
            .unwrap();
        assert!(report.passed());
        assert_eq!(report.steps_run, 0);
    }
}
