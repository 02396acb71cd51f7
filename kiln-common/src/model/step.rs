// kiln-common/src/model/step.rs
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One entry of an install or test procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Execute `program` with `args`. The program is looked up on the step's PATH.
    Run {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Run `script` with `/bin/sh -c`.
    Shell { script: String },
    /// Run a command and check its exit status and combined output.
    AssertOutput {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        status: Option<i32>,
        #[serde(default)]
        contains: Option<String>,
        #[serde(default)]
        matches: Option<String>,
    },
    /// Check that a path below the install prefix exists.
    AssertExists { path: String },
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Run { .. } => "run",
            Step::Shell { .. } => "shell",
            Step::AssertOutput { .. } => "assert_output",
            Step::AssertExists { .. } => "assert_exists",
        }
    }

    /// Every template string the step carries, in evaluation order.
    pub fn templates(&self) -> Vec<&str> {
        match self {
            Step::Run { program, args, env } => std::iter::once(program.as_str())
                .chain(args.iter().map(String::as_str))
                .chain(env.values().map(String::as_str))
                .collect(),
            Step::Shell { script } => vec![script.as_str()],
            Step::AssertOutput { program, args, .. } => std::iter::once(program.as_str())
                .chain(args.iter().map(String::as_str))
                .collect(),
            Step::AssertExists { path } => vec![path.as_str()],
        }
    }

    pub fn is_assertion(&self) -> bool {
        matches!(self, Step::AssertOutput { .. } | Step::AssertExists { .. })
    }
}
