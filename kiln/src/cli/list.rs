// kiln/src/cli/list.rs
use std::collections::BTreeMap;

use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::keg::{InstalledKeg, KegRegistry};
use kiln_common::Formulary;
use prettytable::{format, Cell, Row, Table};
use tracing::debug;

#[derive(Args, Debug)]
pub struct List {
    /// Show every installed version, not just the active one
    #[arg(long)]
    pub versions: bool,
}

impl List {
    pub async fn run(&self, config: &Config) -> Result<i32> {
        let kegs = KegRegistry::new(config.clone()).list_installed_kegs()?;
        let shown = select_kegs(kegs, self.versions);
        if shown.is_empty() {
            println!("{}", "0 formulae installed".yellow());
            return Ok(0);
        }

        // Only used to flag outdated kegs; a broken formula directory must not hide the list.
        let formulary = match Formulary::load(config) {
            Ok(formulary) => Some(formulary),
            Err(e) => {
                debug!("Not checking for newer versions: {}", e);
                None
            }
        };

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.add_row(Row::new(vec![
            Cell::new("Name").style_spec("b"),
            Cell::new("Installed").style_spec("b"),
            Cell::new("Active").style_spec("b"),
            Cell::new("Available").style_spec("b"),
            Cell::new("Installed at").style_spec("b"),
        ]));
        let mut names = 0;
        let mut last_name: Option<&str> = None;
        for keg in &shown {
            if last_name != Some(keg.name.as_str()) {
                names += 1;
                last_name = Some(keg.name.as_str());
            }
            let available = formulary
                .as_ref()
                .and_then(|f| f.get(&keg.name).ok())
                .map(|f| f.version.clone());
            let available_cell = match available {
                Some(v) if v != keg.version_str => Cell::new(&v).style_spec("Fy"),
                Some(v) => Cell::new(&v),
                None => Cell::new("-"),
            };
            table.add_row(Row::new(vec![
                Cell::new(&keg.name).style_spec("Fb"),
                Cell::new(&keg.version_str),
                Cell::new(if keg.active { "✔" } else { "" }),
                available_cell,
                Cell::new(&keg.receipt.installed_at.format("%Y-%m-%d %H:%M").to_string()),
            ]));
        }
        table.printstd();
        println!("{}", format!("{names} formulae installed").bold());
        Ok(0)
    }
}

/// One keg per formula (the active one, else the newest receipt) unless
/// `all_versions`; sorted by name then version.
fn select_kegs(kegs: Vec<InstalledKeg>, all_versions: bool) -> Vec<InstalledKeg> {
    let mut shown: Vec<InstalledKeg> = if all_versions {
        kegs
    } else {
        let mut by_name: BTreeMap<String, InstalledKeg> = BTreeMap::new();
        for keg in kegs {
            let replace = match by_name.get(&keg.name) {
                None => true,
                Some(current) => {
                    !current.active
                        && (keg.active || keg.receipt.installed_at > current.receipt.installed_at)
                }
            };
            if replace {
                by_name.insert(keg.name.clone(), keg);
            }
        }
        by_name.into_values().collect()
    };
    shown.sort_by(|a, b| a.name.cmp(&b.name).then(a.version_str.cmp(&b.version_str)));
    shown
}
