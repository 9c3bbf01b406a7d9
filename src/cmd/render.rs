//! `onboard render`: offline validation and tfvars rendering.

use std::path::Path;

use anyhow::{Context, Result, bail};
use onboard::onboarding::models::OnboardingConfig;
use onboard::onboarding::tfvars::write_tfvars;
use onboard::onboarding::validate::validate;

pub async fn cmd_render(input: &Path, out: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let config: OnboardingConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid onboarding config in {}", input.display()))?;

    if let Err(errors) = validate(&config) {
        for error in &errors.errors {
            eprintln!("  {}: {}", error.field, error.message);
        }
        bail!("Validation failed ({} errors)", errors.errors.len());
    }

    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("Failed to create {}", out.display()))?;
    let path = write_tfvars(&config, out)
        .await
        .with_context(|| format!("Failed to write tfvars into {}", out.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}
