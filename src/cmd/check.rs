//! `onboard check`

use std::path::Path;

use anyhow::{Context, Result, bail};
use onboard::onboarding::prerequisites::check_prerequisites;
use onboard::onboarding::runner::ProcessRunner;

use super::load_config;
use crate::Cli;

pub async fn cmd_check(cli: &Cli, json: bool) -> Result<()> {
    let config = load_config(cli)?;
    let report = check_prerequisites(&ProcessRunner, &config.tools, Path::new(".")).await;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        for check in &report.checks {
            let mark = if check.ok { "ok" } else { "FAIL" };
            println!("{:<12} {:<5} {}", check.name, mark, check.detail.trim());
        }
    }

    if !report.all_ok() {
        bail!("One or more prerequisite checks failed");
    }
    Ok(())
}
