// kiln/src/cli/info.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::keg::KegRegistry;
use kiln_common::model::{Formula, Step};
use kiln_common::Formulary;
use prettytable::{format, Cell, Row, Table};

#[derive(Args, Debug)]
pub struct Info {
    /// Name of the formula
    pub name: String,

    /// Print the parsed formula as JSON
    #[arg(long)]
    pub json: bool,
}

impl Info {
    pub async fn run(&self, config: &Config) -> Result<i32> {
        let formulary = Formulary::load(config)?;
        let formula = formulary.get(&self.name)?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&*formula)?);
            return Ok(0);
        }
        print_formula(&formula);

        let kegs = KegRegistry::new(config.clone()).installed_kegs(&formula.name)?;
        println!();
        if kegs.is_empty() {
            println!("{}", "Not installed".dimmed());
        } else {
            for keg in kegs {
                let marker = if keg.active {
                    " (active)".green().to_string()
                } else {
                    String::new()
                };
                println!(
                    "{} {}{} {}",
                    "Installed:".bold(),
                    keg.version_str,
                    marker,
                    keg.path.display().to_string().dimmed()
                );
            }
        }
        Ok(0)
    }
}

fn print_formula(formula: &Formula) {
    println!("{} {}", formula.name.green().bold(), formula.version);
    println!("{}", formula.desc);
    println!("{}", formula.homepage.blue().underline());
    println!("{} {}", "License:".bold(), formula.license);
    println!("{} {}", "Source:".bold(), formula.url);
    println!("{} {}", "sha256:".bold(), formula.sha256.dimmed());

    if !formula.dependencies.is_empty() {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_CLEAN);
        for dep in &formula.dependencies {
            table.add_row(Row::new(vec![
                Cell::new(&dep.name).style_spec("Fc"),
                Cell::new(dep.kind_label()),
            ]));
        }
        println!("\n{}", "Dependencies".bold());
        table.printstd();
    }
    if !formula.flags.is_empty() {
        println!("\n{}", "Flags".bold());
        for (name, value) in &formula.flags {
            println!("  {name} = {value:?}");
        }
    }
    println!("\n{}", "Install".bold());
    for (i, step) in formula.install.iter().enumerate() {
        println!("  {}. {}", i + 1, describe(step));
    }
    println!("\n{}", "Test".bold());
    if formula.test.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for (i, step) in formula.test.iter().enumerate() {
        println!("  {}. {}", i + 1, describe(step));
    }
}

fn describe(step: &Step) -> String {
    match step {
        Step::Run { program, args, .. } => std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        Step::Shell { script } => format!("sh -c {script:?}"),
        Step::AssertOutput {
            program,
            args,
            status,
            contains,
            matches,
        } => {
            let mut line = std::iter::once(program.as_str())
                .chain(args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            if let Some(status) = status {
                line.push_str(&format!(", exit {status}"));
            }
            if let Some(needle) = contains {
                line.push_str(&format!(", output contains {needle:?}"));
            }
            if let Some(pattern) = matches {
                line.push_str(&format!(", output matches /{pattern}/"));
            }
            line
        }
        Step::AssertExists { path } => format!("{path} exists"),
    }
}
