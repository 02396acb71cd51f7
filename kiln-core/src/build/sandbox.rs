// kiln-core/src/build/sandbox.rs
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kiln_aio::extract::extract_archive_async;
use kiln_aio::process::run_captured;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::{Formula, TemplateContext};
use kiln_common::pipeline::{PipelineEvent, Procedure};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::env::{BuildEnvironment, SandboxPaths};
use crate::fetch::FetchedSource;
use crate::step::{PreparedStep, StepContext};
use crate::{emit, EventSender};

/// Captured output of one install step.
#[derive(Debug, Clone)]
pub struct StepLog {
    pub index: usize,
    pub command: String,
    pub output: String,
    pub truncated: bool,
}

/// A finished build. Owns the sandbox; dropping this value removes it.
#[derive(Debug)]
pub struct BuildResult {
    workdir: TempDir,
    output_dir: PathBuf,
    buildpath: PathBuf,
    logs: Vec<StepLog>,
}

impl BuildResult {
    /// Everything the install steps placed under `{prefix}`.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn buildpath(&self) -> &Path {
        &self.buildpath
    }

    pub fn work_dir(&self) -> &Path {
        self.workdir.path()
    }

    pub fn step_logs(&self) -> &[StepLog] {
        &self.logs
    }

    /// Removes the sandbox now, reporting failures instead of ignoring them.
    pub fn cleanup(self) -> Result<()> {
        let path = self.workdir.path().to_path_buf();
        self.workdir.close()?;
        debug!("Removed build sandbox {}", path.display());
        Ok(())
    }
}

/// Dependency prefixes exposed to a build, in search order.
pub type DependencyPrefixes = Vec<(String, PathBuf)>;

/// Runs the install procedure of `formula` over `source` in a fresh sandbox
/// below `<root>/tmp`. Steps run in order and the first failure aborts the
/// build with a [`KilnError::Build`] carrying the step's output. The sandbox is
/// removed on every path out of this function except success, where the
/// returned [`BuildResult`] takes ownership of it.
#[instrument(skip_all, fields(formula = %formula.name))]
pub async fn build(
    config: &Config,
    formula: &Formula,
    source: &FetchedSource,
    deps: &DependencyPrefixes,
    cancel: &CancellationToken,
    events: &EventSender,
) -> Result<BuildResult> {
    if cancel.is_cancelled() {
        return Err(KilnError::Cancelled);
    }
    tokio::fs::create_dir_all(config.tmp_dir()).await?;
    let workdir = tempfile::Builder::new()
        .prefix(&format!("kiln-build-{}-", formula.name))
        .tempdir_in(config.tmp_dir())?;
    debug!("Created build sandbox {}", workdir.path().display());

    let paths = SandboxPaths {
        home: workdir.path().join("home"),
        tmp: workdir.path().join("tmp"),
        prefix: workdir.path().join("prefix"),
    };
    for dir in [&paths.home, &paths.tmp, &paths.prefix] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let buildpath = extract_archive_async(source.path(), &workdir.path().join("src")).await?;
    debug!("Build path is {}", buildpath.display());

    let dep_prefixes: Vec<PathBuf> = deps.iter().map(|(_, p)| p.clone()).collect();
    let opt_paths: HashMap<String, PathBuf> = deps.iter().cloned().collect();
    let env = BuildEnvironment::for_build(config, &paths, &dep_prefixes)?;
    let template = TemplateContext {
        name: &formula.name,
        version: &formula.version,
        prefix: &paths.prefix,
        buildpath: Some(&buildpath),
        flags: &formula.flags,
        opt_paths: &opt_paths,
    };
    let ctx = StepContext {
        template: &template,
        env: &env,
        cwd: &buildpath,
        timeout: Some(config.step_timeout),
    };

    let mut logs = Vec::with_capacity(formula.install.len());
    for (offset, step) in formula.install.iter().enumerate() {
        let index = offset + 1;
        let prepared = match ctx.prepare(step) {
            Ok(prepared) => prepared,
            Err(KilnError::NotFound(tool)) => {
                return Err(KilnError::Build {
                    step: index,
                    command: tool.clone(),
                    exit_status: "command not found".to_string(),
                    output: format!(
                        "{tool}: not found on PATH {}",
                        env.get_var("PATH").unwrap_or_default()
                    ),
                });
            }
            Err(e) => return Err(e),
        };
        let command = prepared.describe();
        emit(
            events,
            PipelineEvent::StepStarted {
                formula: formula.name.clone(),
                procedure: Procedure::Install,
                index,
                command: command.clone(),
            },
        );
        let result = run_install_step(index, &prepared, cancel).await;
        emit(
            events,
            PipelineEvent::StepFinished {
                formula: formula.name.clone(),
                procedure: Procedure::Install,
                index,
                success: result.is_ok(),
            },
        );
        logs.push(result?);
    }

    Ok(BuildResult {
        workdir,
        output_dir: paths.prefix,
        buildpath,
        logs,
    })
}

async fn run_install_step(
    index: usize,
    prepared: &PreparedStep,
    cancel: &CancellationToken,
) -> Result<StepLog> {
    let command = prepared.describe();
    match prepared {
        PreparedStep::Exists { path } => {
            if path.symlink_metadata().is_ok() {
                Ok(StepLog {
                    index,
                    command,
                    output: String::new(),
                    truncated: false,
                })
            } else {
                Err(KilnError::Build {
                    step: index,
                    command,
                    exit_status: "missing".to_string(),
                    output: format!("{} does not exist", path.display()),
                })
            }
        }
        PreparedStep::Command { spec, expect } => {
            let outcome = match run_captured(spec, cancel).await {
                Ok(outcome) => outcome,
                Err(KilnError::Io(e)) => {
                    return Err(KilnError::Build {
                        step: index,
                        command,
                        exit_status: "failed to start".to_string(),
                        output: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            };
            debug!("Step {} output:\n{}", index, outcome.output.trim_end());
            let failures = match expect {
                Some(expect) => expect.check(&outcome),
                None if outcome.success() => Vec::new(),
                None => vec![outcome.describe_status()],
            };
            if !failures.is_empty() {
                return Err(KilnError::Build {
                    step: index,
                    command,
                    exit_status: failures.join("; "),
                    output: outcome.output,
                });
            }
            Ok(StepLog {
                index,
                command,
                output: outcome.output,
                truncated: outcome.truncated,
            })
        }
    }
}
