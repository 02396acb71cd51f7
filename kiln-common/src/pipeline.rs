// kiln-common/src/pipeline.rs
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Stage};

/// Per-formula state within one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormulaState {
    Pending,
    Resolved,
    Fetched,
    Built,
    Installed,
    Verified,
    Failed { stage: Stage, cause: String },
    /// Not attempted because a dependency failed.
    Skipped { blocked_by: String },
}

impl FormulaState {
    pub fn failed(stage: Stage, cause: &KilnError) -> Self {
        FormulaState::Failed {
            stage,
            cause: cause.to_string(),
        }
    }

    /// Dependents may proceed once a dependency reached one of these states.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(
            self,
            FormulaState::Installed
                | FormulaState::Verified
                | FormulaState::Failed {
                    stage: Stage::Verify,
                    ..
                }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            FormulaState::Pending => "Pending",
            FormulaState::Resolved => "Resolved",
            FormulaState::Fetched => "Fetched",
            FormulaState::Built => "Built",
            FormulaState::Installed => "Installed",
            FormulaState::Verified => "Verified",
            FormulaState::Failed { .. } => "Failed",
            FormulaState::Skipped { .. } => "Skipped",
        }
    }
}

impl fmt::Display for FormulaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormulaState::Failed { stage, cause } => write!(f, "Failed at {stage}: {cause}"),
            FormulaState::Skipped { blocked_by } => write!(f, "Skipped (blocked by {blocked_by})"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Procedure {
    Install,
    Test,
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Procedure::Install => "install",
            Procedure::Test => "test",
        })
    }
}

/// Progress notifications broadcast to whoever renders them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    SessionStarted {
        targets: Vec<String>,
    },
    PlanResolved {
        order: Vec<String>,
    },
    StateChanged {
        formula: String,
        state: FormulaState,
    },
    DownloadStarted {
        formula: String,
        url: String,
    },
    DownloadFinished {
        formula: String,
        path: PathBuf,
        size_bytes: u64,
        cached: bool,
    },
    FetchRetry {
        formula: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepStarted {
        formula: String,
        procedure: Procedure,
        index: usize,
        command: String,
    },
    StepFinished {
        formula: String,
        procedure: Procedure,
        index: usize,
        success: bool,
    },
    VerificationWarning {
        formula: String,
        failures: Vec<String>,
    },
    SessionFinished {
        duration_secs: f64,
        success_count: usize,
        fail_count: usize,
        skipped_count: usize,
    },
}

impl PipelineEvent {
    pub fn state(formula: &str, state: FormulaState) -> Self {
        PipelineEvent::StateChanged {
            formula: formula.to_string(),
            state,
        }
    }
}
