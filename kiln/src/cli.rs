// kiln/src/cli.rs
//! Defines the command-line argument structure using clap.
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use kiln_common::error::Result;
use kiln_common::Config;
use tokio_util::sync::CancellationToken;

pub mod info;
pub mod install;
pub mod list;
pub mod status;
pub mod uninstall;

use crate::cli::info::Info;
use crate::cli::install::InstallArgs;
use crate::cli::list::List;
use crate::cli::test::TestArgs;
use crate::cli::uninstall::Uninstall;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "kiln", bin_name = "kiln")]
#[command(propagate_version = true)]
pub struct CliArgs {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Root of all kiln state (overrides KILN_ROOT)
    #[arg(long, value_name = "DIR", global = true)]
    pub root: Option<PathBuf>,

    /// Directory holding formula files; may be repeated (overrides KILN_FORMULA_PATH)
    #[arg(long = "formula-dir", value_name = "DIR", global = true)]
    pub formula_dirs: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl CliArgs {
    /// The environment configuration with command-line overrides applied.
    pub fn config(&self) -> Result<Config> {
        let mut config = Config::load()?;
        if let Some(root) = &self.root {
            config.relocate(root);
        }
        if !self.formula_dirs.is_empty() {
            config.formula_dirs = self.formula_dirs.clone();
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Install(InstallArgs),
    Uninstall(Uninstall),
    Test(TestArgs),
    List(List),
    Info(Info),
}

impl Command {
    /// Runs the command and returns the process exit code.
    pub async fn run(&self, config: &Config, cancel: &CancellationToken) -> Result<i32> {
        match self {
            Self::Install(command) => command.run(config, cancel).await,
            Self::Uninstall(command) => command.run(config, cancel).await,
            Self::Test(command) => command.run(config, cancel).await,
            Self::List(command) => command.run(config).await,
            Self::Info(command) => command.run(config).await,
        }
    }
}
