// kiln/src/cli/uninstall.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_core::{uninstall, UninstallOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Args, Debug)]
pub struct Uninstall {
    /// The names of the formulae to uninstall
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Remove formulae even if installed formulae depend on them at runtime
    #[arg(long)]
    pub force: bool,
}

impl Uninstall {
    pub async fn run(&self, config: &Config, cancel: &CancellationToken) -> Result<i32> {
        let options = UninstallOptions { force: self.force };
        let mut errors: Vec<(String, KilnError)> = Vec::new();

        for name in &self.names {
            if cancel.is_cancelled() {
                errors.push((name.clone(), KilnError::Cancelled));
                break;
            }
            println!("Uninstalling {}...", name.cyan());
            match uninstall(config, name, options, cancel).await {
                Ok(report) => {
                    debug!("Uninstall report: {:?}", report);
                    println!(
                        "✓ Uninstalled {} {} ({} link(s) removed)",
                        name.green(),
                        report.removed_versions.join(", "),
                        report.removed_links
                    );
                }
                Err(e) => {
                    error!("✖ Failed to uninstall '{}': {}", name, e);
                    eprintln!("{} {}: {}", "Error:".red().bold(), name.cyan(), e);
                    errors.push((name.clone(), e));
                }
            }
        }

        Ok(errors.first().map_or(0, |(_, e)| e.exit_code()))
    }
}
