//! `onboard serve`

use std::sync::Arc;

use anyhow::Result;
use onboard::onboarding::runner::{CommandRunner, ProcessRunner, ScriptedRunner};
use onboard::onboarding::server::start_server;

use super::load_config;
use crate::Cli;

/// Outputs reported by every deployment in dry-run mode.
const DRY_RUN_OUTPUTS: &str =
    r#"{"dry_run":{"sensitive":false,"type":"bool","value":true}}"#;

pub async fn cmd_serve(
    cli: &Cli,
    host: Option<String>,
    port: Option<u16>,
    dry_run: bool,
) -> Result<()> {
    let mut config = load_config(cli)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let runner: Arc<dyn CommandRunner> = if dry_run {
        tracing::warn!("Dry-run mode: az and terraform will not be invoked");
        let outputs_prefix = format!("{} output", config.tools.terraform);
        Arc::new(ScriptedRunner::new().respond(&outputs_prefix, DRY_RUN_OUTPUTS))
    } else {
        Arc::new(ProcessRunner)
    };

    tracing::info!(
        work_root = %config.deployments.work_root.display(),
        template_dir = %config.deployments.template_dir.display(),
        retention_secs = config.deployments.retention_secs,
        "Starting onboarding service"
    );
    start_server(config, runner).await
}
