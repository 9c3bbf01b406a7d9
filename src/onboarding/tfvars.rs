//! Renders `terraform.tfvars` from an onboarding configuration.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::models::OnboardingConfig;

pub const TFVARS_FILE: &str = "terraform.tfvars";

/// Quote a value as an HCL string literal.
fn hcl_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // Template interpolation sequences must be escaped by doubling.
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Render the full tfvars document. Pure; no I/O.
pub fn render_tfvars(config: &OnboardingConfig) -> String {
    let features = &config.features;
    let mut out = String::new();

    // Writing to a String cannot fail.
    let _ = writeln!(out, "# Azure Configuration");
    let _ = writeln!(out, "subscription_id = {}", hcl_string(&config.subscription_id));
    let _ = writeln!(out, "tenant_id       = {}", hcl_string(&config.tenant_id));
    let _ = writeln!(out, "app_name        = {}", hcl_string(&config.app_name));
    let _ = writeln!(out);
    let _ = writeln!(out, "# Cortex Cloud Configuration");
    let _ = writeln!(out, "cortex_api_url     = {}", hcl_string(&config.cortex_api_url));
    let _ = writeln!(out, "cortex_access_key  = {}", hcl_string(&config.cortex_access_key));
    let _ = writeln!(out, "cortex_secret_key  = {}", hcl_string(&config.cortex_secret_key));
    let _ = writeln!(out, "azure_account_name = {}", hcl_string(&config.azure_account_name));
    let _ = writeln!(out);
    let _ = writeln!(out, "# Cortex Cloud Features");
    let _ = writeln!(out, "enable_cloud_visibility        = {}", features.cloud_visibility());
    let _ = writeln!(out, "enable_agentless_scanning      = {}", features.agentless_scanning());
    let _ = writeln!(out, "enable_serverless_scanning     = {}", features.serverless_scanning());
    let _ = writeln!(out, "enable_agent_based_protection  = {}", features.agent_based_protection());
    let _ = writeln!(out, "enable_remediation             = {}", features.remediation());
    let _ = writeln!(out);
    let _ = writeln!(out, "# Azure Infrastructure Options");
    let _ = writeln!(out, "monitor_flow_logs  = {}", config.monitor_flow_logs());
    let _ = writeln!(out, "enable_audit_logs  = true");
    let _ = writeln!(out, "enable_azure_ad    = true");
    let _ = writeln!(out);
    let _ = writeln!(out, "# Optional Configuration");
    let _ = writeln!(out, "environment        = {}", hcl_string(&config.environment));
    let _ = writeln!(out, "azure_region       = {}", hcl_string(&config.azure_region));
    let _ = writeln!(out, "log_retention_days = {}", config.log_retention_days);

    out
}

/// Write `terraform.tfvars` into `work_dir`, returning its path.
pub async fn write_tfvars(config: &OnboardingConfig, work_dir: &Path) -> std::io::Result<PathBuf> {
    let path = work_dir.join(TFVARS_FILE);
    tokio::fs::write(&path, render_tfvars(config)).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onboarding::models::Features;
    use crate::onboarding::models::fixtures::sample_config;
    use std::collections::HashMap;

    /// Parse `key = value` lines, ignoring comments and blanks.
    fn parse(rendered: &str) -> HashMap<String, String> {
        rendered
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect()
    }

    #[test]
    fn test_renders_every_key() {
        let vars = parse(&render_tfvars(&sample_config()));
        for key in [
            "subscription_id",
            "tenant_id",
            "app_name",
            "cortex_api_url",
            "cortex_access_key",
            "cortex_secret_key",
            "azure_account_name",
            "enable_cloud_visibility",
            "enable_agentless_scanning",
            "enable_serverless_scanning",
            "enable_agent_based_protection",
            "enable_remediation",
            "monitor_flow_logs",
            "enable_audit_logs",
            "enable_azure_ad",
            "environment",
            "azure_region",
            "log_retention_days",
        ] {
            assert!(vars.contains_key(key), "missing {key}");
        }
        assert_eq!(vars.len(), 18);
        assert_eq!(vars["log_retention_days"], "30");
        assert_eq!(vars["app_name"], "\"cortex-onboarding\"");
    }

    #[test]
    fn test_feature_defaults_rendered() {
        let vars = parse(&render_tfvars(&sample_config()));
        assert_eq!(vars["enable_cloud_visibility"], "true");
        assert_eq!(vars["enable_agentless_scanning"], "true");
        assert_eq!(vars["enable_serverless_scanning"], "true");
        assert_eq!(vars["enable_agent_based_protection"], "false");
        assert_eq!(vars["enable_remediation"], "false");
    }

    #[test]
    fn test_all_features_disabled_keeps_infrastructure_toggles_on() {
        let mut config = sample_config();
        config.features = Features::all(false);
        let vars = parse(&render_tfvars(&config));
        for key in [
            "enable_cloud_visibility",
            "enable_agentless_scanning",
            "enable_serverless_scanning",
            "enable_agent_based_protection",
            "enable_remediation",
        ] {
            assert_eq!(vars[key], "false", "{key}");
        }
        assert_eq!(vars["monitor_flow_logs"], "true");
        assert_eq!(vars["enable_audit_logs"], "true");
        assert_eq!(vars["enable_azure_ad"], "true");
    }

    #[test]
    fn test_explicit_flow_log_opt_out_is_honoured() {
        let mut config = sample_config();
        config.monitor_flow_logs = Some(false);
        let vars = parse(&render_tfvars(&config));
        assert_eq!(vars["monitor_flow_logs"], "false");
        assert_eq!(vars["enable_audit_logs"], "true");
    }

    #[test]
    fn test_hcl_string_escaping() {
        assert_eq!(hcl_string("plain"), "\"plain\"");
        assert_eq!(hcl_string("a\"b"), "\"a\\\"b\"");
        assert_eq!(hcl_string("a\\b"), "\"a\\\\b\"");
        assert_eq!(hcl_string("line\nbreak"), "\"line\\nbreak\"");
        assert_eq!(hcl_string("${var.x}"), "\"$${var.x}\"");
        assert_eq!(hcl_string("%{if}"), "\"%%{if}\"");
        assert_eq!(hcl_string("cost $5"), "\"cost $5\"");
    }

    #[tokio::test]
    async fn test_write_tfvars_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tfvars(&sample_config(), dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join(TFVARS_FILE));
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.starts_with("# Azure Configuration"));
    }

    #[tokio::test]
    async fn test_write_tfvars_missing_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does/not/exist");
        assert!(write_tfvars(&sample_config(), &missing).await.is_err());
    }
}
