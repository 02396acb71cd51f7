// kiln-core/src/step.rs
// Turns formula steps into concrete commands and checks assertion results.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use kiln_aio::process::{CommandOutcome, CommandSpec};
use kiln_common::error::{KilnError, Result};
use kiln_common::model::{Step, TemplateContext};
use regex::Regex;

use crate::build::env::BuildEnvironment;

/// What to check after an `assert_output` command ran.
#[derive(Debug, Clone)]
pub struct Expectation {
    pub status: Option<i32>,
    pub contains: Option<String>,
    pub matches: Option<Regex>,
}

impl Expectation {
    /// Every unmet expectation, described for the user. Empty when all hold.
    pub fn check(&self, outcome: &CommandOutcome) -> Vec<String> {
        let mut failures = Vec::new();
        if outcome.timed_out {
            failures.push("command timed out".to_string());
            return failures;
        }
        if let Some(expected) = self.status {
            match outcome.status.code() {
                Some(code) if code == expected => {}
                Some(code) => failures.push(format!("expected exit status {expected}, got {code}")),
                None => failures.push(format!(
                    "expected exit status {expected}, got {}",
                    outcome.describe_status()
                )),
            }
        }
        if let Some(needle) = &self.contains {
            if !outcome.output.contains(needle.as_str()) {
                failures.push(format!("output does not contain \"{needle}\""));
            }
        }
        if let Some(pattern) = &self.matches {
            if !pattern.is_match(&outcome.output) {
                failures.push(format!("output does not match /{}/", pattern.as_str()));
            }
        }
        failures
    }
}

#[derive(Debug, Clone)]
pub enum PreparedStep {
    /// A command to run; assertions carry their expectation.
    Command {
        spec: CommandSpec,
        expect: Option<Expectation>,
    },
    /// A path under the formula prefix that must exist.
    Exists { path: PathBuf },
}

impl PreparedStep {
    pub fn describe(&self) -> String {
        match self {
            PreparedStep::Command { spec, .. } => spec.to_string(),
            PreparedStep::Exists { path } => format!("test -e {}", path.display()),
        }
    }
}

/// Everything needed to turn a [`Step`] into a [`PreparedStep`].
pub struct StepContext<'a> {
    pub template: &'a TemplateContext<'a>,
    pub env: &'a BuildEnvironment,
    pub cwd: &'a Path,
    pub timeout: Option<Duration>,
}

impl StepContext<'_> {
    /// Expands templates and resolves the program on the sandbox PATH.
    /// A program that cannot be found is reported as `KilnError::NotFound`.
    pub fn prepare(&self, step: &Step) -> Result<PreparedStep> {
        match step {
            Step::Run { program, args, env } => {
                let mut overrides = BTreeMap::new();
                for (key, value) in env {
                    overrides.insert(key.clone(), self.template.expand(value)?);
                }
                let spec = self.command(program, args, &overrides)?;
                Ok(PreparedStep::Command { spec, expect: None })
            }
            Step::Shell { script } => {
                let script = self.template.expand(script)?;
                let mut spec = CommandSpec::new("/bin/sh", vec!["-c".to_string(), script]);
                self.finish(&mut spec, &BTreeMap::new());
                Ok(PreparedStep::Command { spec, expect: None })
            }
            Step::AssertOutput {
                program,
                args,
                status,
                contains,
                matches,
            } => {
                let spec = self.command(program, args, &BTreeMap::new())?;
                let matches = matches
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| {
                        KilnError::malformed(self.template.name, format!("invalid regex: {e}"))
                    })?;
                Ok(PreparedStep::Command {
                    spec,
                    expect: Some(Expectation {
                        status: *status,
                        contains: contains.clone(),
                        matches,
                    }),
                })
            }
            Step::AssertExists { path } => {
                let rel = PathBuf::from(self.template.expand(path)?);
                let escapes = rel.is_absolute()
                    || rel.components().any(|c| matches!(c, Component::ParentDir));
                if escapes {
                    return Err(KilnError::malformed(
                        self.template.name,
                        format!(
                            "assert_exists path '{}' must stay inside the prefix",
                            rel.display()
                        ),
                    ));
                }
                Ok(PreparedStep::Exists {
                    path: self.template.prefix.join(rel),
                })
            }
        }
    }

    fn command(
        &self,
        program: &str,
        args: &[String],
        overrides: &BTreeMap<String, String>,
    ) -> Result<CommandSpec> {
        let program = self.template.expand(program)?;
        let resolved = self.env.resolve_program(&program, self.cwd)?;
        let args = self.template.expand_args(args)?;
        let mut spec = CommandSpec::new(resolved, args);
        self.finish(&mut spec, overrides);
        Ok(spec)
    }

    fn finish(&self, spec: &mut CommandSpec, overrides: &BTreeMap<String, String>) {
        spec.cwd = Some(self.cwd.to_path_buf());
        spec.env = Some(self.env.with_overrides(overrides));
        spec.timeout = self.timeout;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    use kiln_common::Config;
    use tempfile::TempDir;

    use super::*;
    use crate::build::env::SandboxPaths;

    fn outcome(code: i32, output: &str) -> CommandOutcome {
        CommandOutcome {
            status: ExitStatus::from_raw(code << 8),
            output: output.to_string(),
            truncated: false,
            timed_out: false,
        }
    }

    #[test]
    fn help_text_with_status_one_passes() {
        let expect = Expectation {
            status: Some(1),
            contains: Some("Guise".to_string()),
            matches: None,
        };
        assert!(expect.check(&outcome(1, "Guise - identity manager\nUsage: ...")).is_empty());
        let failures = expect.check(&outcome(0, "usage"));
        assert_eq!(failures.len(), 2);
        assert!(failures[0].contains("expected exit status 1, got 0"));
    }

    #[test]
    fn prepares_commands_against_the_sandbox() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_root(dir.path());
        let paths = SandboxPaths {
            home: dir.path().join("home"),
            tmp: dir.path().join("tmp"),
            prefix: dir.path().join("out"),
        };
        let env = BuildEnvironment::for_build(&config, &paths, &[]).unwrap();
        let flags = BTreeMap::from([("ldflags".to_string(), "-s -w".to_string())]);
        let opt = HashMap::new();
        let template = TemplateContext {
            name: "guise",
            version: "0.1.0",
            prefix: &paths.prefix,
            buildpath: Some(dir.path()),
            flags: &flags,
            opt_paths: &opt,
        };
        let ctx = StepContext {
            template: &template,
            env: &env,
            cwd: dir.path(),
            timeout: None,
        };

        let shell = ctx
            .prepare(&Step::Shell {
                script: "mkdir -p {bin}".to_string(),
            })
            .unwrap();
        match shell {
            PreparedStep::Command { spec, expect } => {
                assert!(expect.is_none());
                let bin = paths.prefix.join("bin");
                assert_eq!(spec.args[1], format!("mkdir -p {}", bin.display()));
                assert_eq!(spec.cwd.as_deref(), Some(dir.path()));
            }
            other => panic!("unexpected {other:?}"),
        }

        let missing = ctx.prepare(&Step::Run {
            program: "no-such-build-tool".to_string(),
            args: vec![],
            env: BTreeMap::new(),
        });
        assert!(matches!(missing, Err(KilnError::NotFound(tool)) if tool == "no-such-build-tool"));

        let exists = ctx
            .prepare(&Step::AssertExists {
                path: "bin/{name}".to_string(),
            })
            .unwrap();
        let guise = paths.prefix.join("bin/guise");
        assert_eq!(exists.describe(), format!("test -e {}", guise.display()));
    }
}
