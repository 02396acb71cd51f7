// kiln/src/cli/install.rs
use clap::Args;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_core::{event_channel, Session, SessionOptions};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::cli::status;

#[derive(Debug, Args)]
pub struct InstallArgs {
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Print the resolved order and what is already installed, then stop
    #[arg(long)]
    pub dry_run: bool,

    /// Formulae processed at the same time (defaults to KILN_JOBS)
    #[arg(long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Also install optional dependencies
    #[arg(long)]
    pub include_optional: bool,
}

impl InstallArgs {
    #[instrument(skip(self, config, cancel), fields(targets = ?self.names))]
    pub async fn run(&self, config: &Config, cancel: &CancellationToken) -> Result<i32> {
        let mut options = SessionOptions::from_config(config);
        options.include_optional = self.include_optional;
        if let Some(jobs) = self.jobs {
            options.jobs = jobs.max(1);
        }

        let (event_tx, event_rx) = event_channel();
        let session =
            Session::for_config(config.clone(), event_tx, cancel.clone())?.with_options(options);

        if self.dry_run {
            let plan = session.plan(&self.names);
            status::print_plan(&plan);
            return Ok(plan.failures.first().map_or(0, |(_, e)| e.exit_code()));
        }

        let printer = tokio::spawn(status::handle_events(event_rx));
        let report = session.install(&self.names).await;
        drop(session);
        if let Err(e) = printer.await {
            tracing::debug!("Status printer stopped: {}", e);
        }
        status::print_report(&report);
        Ok(report.exit_code())
    }
}
