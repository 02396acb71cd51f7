// kiln/src/cli/status.rs
// Renders pipeline events and the final session report for the terminal.
use std::collections::HashMap;

use colored::*;
use kiln_common::pipeline::{FormulaState, PipelineEvent, Procedure};
use kiln_core::{Plan, SessionReport};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Waiting,
    Downloading,
    Building,
    Installing,
    Installed,
    Testing,
    Success,
    Warning,
    Skipped,
    Failed,
}

impl JobStatus {
    fn from_state(state: &FormulaState) -> Self {
        match state {
            FormulaState::Pending | FormulaState::Resolved => JobStatus::Waiting,
            FormulaState::Fetched => JobStatus::Building,
            FormulaState::Built => JobStatus::Installing,
            FormulaState::Installed => JobStatus::Installed,
            FormulaState::Verified => JobStatus::Success,
            FormulaState::Failed {
                stage: kiln_common::Stage::Verify,
                ..
            } => JobStatus::Warning,
            FormulaState::Failed { .. } => JobStatus::Failed,
            FormulaState::Skipped { .. } => JobStatus::Skipped,
        }
    }

    fn colored_state(&self) -> ColoredString {
        match self {
            JobStatus::Waiting => "waiting".dimmed(),
            JobStatus::Downloading => "downloading".yellow(),
            JobStatus::Building => "building".blue(),
            JobStatus::Installing => "installing".magenta(),
            JobStatus::Installed => "installed".green(),
            JobStatus::Testing => "testing".cyan(),
            JobStatus::Success => "success".green().bold(),
            JobStatus::Warning => "unverified".yellow().bold(),
            JobStatus::Skipped => "skipped".dimmed(),
            JobStatus::Failed => "failed".red().bold(),
        }
    }

    fn indicator(&self) -> ColoredString {
        match self {
            JobStatus::Waiting => "·".dimmed(),
            JobStatus::Downloading => "↓".yellow(),
            JobStatus::Building | JobStatus::Installing | JobStatus::Testing => "⚙".blue(),
            JobStatus::Installed => "✓".green(),
            JobStatus::Success => "✓".green().bold(),
            JobStatus::Warning => "!".yellow().bold(),
            JobStatus::Skipped => "-".dimmed(),
            JobStatus::Failed => "✗".red().bold(),
        }
    }
}

/// Prints one line per status change until the session finishes or the
/// sender goes away.
pub async fn handle_events(mut event_rx: broadcast::Receiver<PipelineEvent>) {
    let mut statuses: HashMap<String, JobStatus> = HashMap::new();
    let mut print = |name: &str, status: JobStatus, detail: String| {
        if statuses.get(name) == Some(&status) && detail.is_empty() {
            return;
        }
        statuses.insert(name.to_string(), status);
        println!(
            "{} {:<12} {:<20} {}",
            status.indicator(),
            status.colored_state(),
            name.cyan(),
            detail.dimmed()
        );
    };

    loop {
        match event_rx.recv().await {
            Ok(event) => match event {
                PipelineEvent::SessionStarted { targets } => {
                    println!("{} {}", "==>".blue().bold(), targets.join(" ").bold());
                }
                PipelineEvent::PlanResolved { order } => {
                    println!("{} {}", "Plan:".bold(), order.join(" → "));
                }
                PipelineEvent::StateChanged { formula, state } => {
                    let status = JobStatus::from_state(&state);
                    // Pending and Resolved are implied by the plan line.
                    if status != JobStatus::Waiting {
                        let detail = match &state {
                            FormulaState::Skipped { blocked_by } => {
                                format!("blocked by {blocked_by}")
                            }
                            _ => String::new(),
                        };
                        print(&formula, status, detail);
                    }
                }
                PipelineEvent::DownloadStarted { formula, url } => {
                    print(&formula, JobStatus::Downloading, url);
                }
                PipelineEvent::DownloadFinished {
                    formula,
                    size_bytes,
                    cached,
                    ..
                } => {
                    let origin = if cached { "cached" } else { "downloaded" };
                    print(
                        &formula,
                        JobStatus::Downloading,
                        format!("{origin} {}", format_bytes(size_bytes)),
                    );
                }
                PipelineEvent::FetchRetry {
                    formula,
                    attempt,
                    delay_ms,
                    error,
                } => {
                    println!(
                        "{} {} retry {} in {}ms: {}",
                        "!".yellow().bold(),
                        formula.cyan(),
                        attempt,
                        delay_ms,
                        error.yellow()
                    );
                }
                PipelineEvent::StepStarted {
                    formula,
                    procedure,
                    index,
                    command,
                } => {
                    let status = match procedure {
                        Procedure::Install => JobStatus::Building,
                        Procedure::Test => JobStatus::Testing,
                    };
                    print(&formula, status, format!("[{index}] {command}"));
                }
                PipelineEvent::VerificationWarning { formula, failures } => {
                    for failure in failures {
                        println!(
                            "  {} {}: {}",
                            "!".yellow().bold(),
                            formula.cyan(),
                            failure.yellow()
                        );
                    }
                }
                PipelineEvent::SessionFinished {
                    duration_secs,
                    success_count,
                    fail_count,
                    skipped_count,
                } => {
                    println!(
                        "\n{}: {}  {}: {}  {}: {}  {}: {:.2}s",
                        "Completed".green().bold(),
                        success_count,
                        "Failed".red().bold(),
                        fail_count,
                        "Skipped".dimmed().bold(),
                        skipped_count,
                        "Elapsed".bold(),
                        duration_secs
                    );
                    break;
                }
                PipelineEvent::StepFinished { .. } => {}
            },
            Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Status printer lagged behind by {} events", skipped);
            }
        }
    }
}

/// Prints every failure with the stage it stopped at and, for build
/// failures, the captured output of the failing step.
pub fn print_report(report: &SessionReport) {
    for record in report.warnings() {
        eprintln!(
            "{} {} installed but its self-test failed:",
            "Warning:".yellow().bold(),
            record.name.cyan()
        );
        if let Some(verification) = &record.verification {
            for failure in &verification.failures {
                eprintln!("  {failure}");
            }
        }
    }
    for record in report.failures() {
        let stage = match record.state() {
            FormulaState::Failed { stage, .. } => stage.to_string(),
            other => other.label().to_ascii_lowercase(),
        };
        let cause = match &record.error {
            Some(e) => e.to_string(),
            None => record.state().to_string(),
        };
        eprintln!(
            "{} {} failed at {}: {}",
            "Error:".red().bold(),
            record.name.cyan(),
            stage.bold(),
            cause
        );
        if let Some(output) = record.error.as_ref().and_then(|e| e.captured_output()) {
            if !output.trim().is_empty() {
                eprintln!("{}", "---- build output ----".dimmed());
                eprintln!("{}", output.trim_end());
                eprintln!("{}", "----------------------".dimmed());
            }
        }
    }
    if report.cancelled {
        eprintln!("{}", "Interrupted".red().bold());
    }
}

pub fn print_plan(plan: &Plan) {
    for (name, e) in &plan.failures {
        eprintln!("{} {}: {}", "Error:".red().bold(), name.cyan(), e);
    }
    let order = plan.order();
    if order.is_empty() {
        return;
    }
    println!("{}", "Would process, in order:".bold());
    for name in order {
        if plan.installed.contains(name) {
            println!("  {} {}", name.cyan(), "(already installed)".dimmed());
        } else {
            println!("  {}", name.cyan());
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit_idx = 0;

    while value >= 1000.0 && unit_idx < UNITS.len() - 1 {
        value /= 1000.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{bytes}B")
    } else {
        format!("{:.1}{}", value, UNITS[unit_idx])
    }
}
