// kiln-core/src/interpreter/report.rs
use std::time::Duration;

use kiln_common::error::{KilnError, Stage, EXIT_CANCELLED, EXIT_GENERIC};
use kiln_common::pipeline::{FormulaState, Procedure};

use crate::verify::VerificationReport;

/// Everything that happened to one formula during a session.
#[derive(Debug, Clone)]
pub struct FormulaRecord {
    pub name: String,
    pub version: Option<String>,
    /// Named on the command line, as opposed to pulled in as a dependency.
    pub requested: bool,
    /// Every state the formula entered, in order.
    pub trace: Vec<FormulaState>,
    pub error: Option<KilnError>,
    pub verification: Option<VerificationReport>,
}

impl FormulaRecord {
    pub fn new(name: impl Into<String>, version: Option<String>, requested: bool) -> Self {
        Self {
            name: name.into(),
            version,
            requested,
            trace: Vec::new(),
            error: None,
            verification: None,
        }
    }

    pub fn state(&self) -> &FormulaState {
        self.trace.last().unwrap_or(&FormulaState::Pending)
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.trace.iter().map(FormulaState::label).collect()
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.state(), FormulaState::Installed | FormulaState::Verified)
    }

    /// Installed but its self-test failed.
    pub fn unverified(&self) -> bool {
        matches!(
            self.state(),
            FormulaState::Failed {
                stage: Stage::Verify,
                ..
            }
        )
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub procedure: Procedure,
    /// Plan order; formulae that could not be resolved come first.
    pub records: Vec<FormulaRecord>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl SessionReport {
    pub fn record(&self, name: &str) -> Option<&FormulaRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn success_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.succeeded() || (self.procedure == Procedure::Install && r.unverified()))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.state(), FormulaState::Skipped { .. }))
            .count()
    }

    pub fn fail_count(&self) -> usize {
        self.records.len() - self.success_count() - self.skipped_count()
    }

    /// Records whose failure decides the outcome. Verification failures only
    /// count when the session was a test run.
    pub fn failures(&self) -> impl Iterator<Item = &FormulaRecord> {
        self.records.iter().filter(move |r| {
            matches!(r.state(), FormulaState::Failed { .. })
                && (self.procedure == Procedure::Test || !r.unverified())
        })
    }

    pub fn warnings(&self) -> impl Iterator<Item = &FormulaRecord> {
        self.records
            .iter()
            .filter(move |r| self.procedure == Procedure::Install && r.unverified())
    }

    /// 0 when nothing failed, 130 after cancellation, otherwise the code of
    /// the stage where the first failure in plan order happened.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            return EXIT_CANCELLED;
        }
        match self.failures().next() {
            None => 0,
            Some(record) => match (&record.error, record.state()) {
                (Some(KilnError::Cancelled), _) => EXIT_CANCELLED,
                (_, FormulaState::Failed { stage, .. }) => stage.exit_code(),
                (Some(err), _) => err.exit_code(),
                _ => EXIT_GENERIC,
            },
        }
    }
}
