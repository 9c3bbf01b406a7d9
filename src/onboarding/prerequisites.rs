//! Host readiness checks: is the Azure CLI installed, is Terraform
//! installed, is the Azure CLI logged in.

use std::path::Path;

use serde::Serialize;

use super::runner::CommandRunner;
use crate::config::ToolSettings;

/// Outcome of one readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrerequisiteCheck {
    pub name: &'static str,
    pub ok: bool,
    /// First line of output on success, the error otherwise.
    pub detail: String,
}

/// Body of `GET /api/check-prerequisites`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisiteReport {
    pub azure_cli: bool,
    pub terraform: bool,
    pub azure_login: bool,
    #[serde(skip)]
    pub checks: Vec<PrerequisiteCheck>,
}

impl PrerequisiteReport {
    pub fn all_ok(&self) -> bool {
        self.azure_cli && self.terraform && self.azure_login
    }
}

async fn run_check(
    runner: &dyn CommandRunner,
    name: &'static str,
    program: &str,
    args: &[&str],
    cwd: &Path,
) -> PrerequisiteCheck {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    match runner.run(program, &args, cwd, &|_: &str| {}).await {
        Ok(transcript) => PrerequisiteCheck {
            name,
            ok: true,
            detail: transcript.stdout.lines().next().unwrap_or_default().trim().to_string(),
        },
        Err(e) => {
            tracing::debug!(check = name, program, error = %e, "Prerequisite check failed");
            PrerequisiteCheck {
                name,
                ok: false,
                detail: e.to_string(),
            }
        }
    }
}

/// Run the three checks concurrently. Command output is discarded apart
/// from the first line kept as detail.
pub async fn check_prerequisites(
    runner: &dyn CommandRunner,
    tools: &ToolSettings,
    cwd: &Path,
) -> PrerequisiteReport {
    let (azure_cli, terraform, azure_login) = tokio::join!(
        run_check(runner, "Azure CLI", &tools.azure_cli, &["--version"], cwd),
        run_check(runner, "Terraform", &tools.terraform, &["--version"], cwd),
        run_check(runner, "Azure login", &tools.azure_cli, &["account", "show"], cwd),
    );
    PrerequisiteReport {
        azure_cli: azure_cli.ok,
        terraform: terraform.ok,
        azure_login: azure_login.ok,
        checks: vec![azure_cli, terraform, azure_login],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onboarding::runner::ScriptedRunner;

    #[tokio::test]
    async fn test_all_checks_pass() {
        let runner = ScriptedRunner::new()
            .respond("az --version", "azure-cli 2.61.0\ncore 2.61.0\n")
            .respond("terraform --version", "Terraform v1.8.5\non linux_amd64\n");
        let report = check_prerequisites(&runner, &ToolSettings::default(), Path::new(".")).await;
        assert!(report.all_ok());
        assert_eq!(report.checks[0].detail, "azure-cli 2.61.0");
        assert_eq!(report.checks[1].detail, "Terraform v1.8.5");
        assert_eq!(runner.invocations().len(), 3);
    }

    #[tokio::test]
    async fn test_logged_out_cli() {
        let runner = ScriptedRunner::new().fail_on(
            "az account show",
            1,
            "Please run 'az login' to setup account.",
        );
        let report = check_prerequisites(&runner, &ToolSettings::default(), Path::new(".")).await;
        assert!(report.azure_cli);
        assert!(report.terraform);
        assert!(!report.azure_login);
        assert!(!report.all_ok());
        assert!(report.checks[2].detail.contains("az login"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"azureCli": true, "terraform": true, "azureLogin": false})
        );
    }

    #[tokio::test]
    async fn test_missing_binary_reports_false() {
        let tools = ToolSettings {
            azure_cli: "az".into(),
            terraform: "definitely-not-installed-terraform-9c1e".into(),
        };
        let runner = crate::onboarding::runner::ProcessRunner;
        let report = check_prerequisites(&runner, &tools, Path::new(".")).await;
        assert!(!report.terraform);
        assert!(!report.all_ok());
    }
}
