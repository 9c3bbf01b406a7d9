//! Service configuration for `onboard serve`.
//!
//! Settings are layered: `onboard.toml` → environment → CLI flags. Every
//! field has a default, so an absent file yields a runnable service.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3001
//! cors = true
//!
//! [deployments]
//! work_root = "deployments"
//! template_dir = "terraform"
//! template_files = ["variables.tf", "azure-roles.tf", "azure-audit-logs.tf", "outputs.tf", "main.tf"]
//! retention_secs = 3600
//! reap_interval_secs = 300
//! remove_work_dirs = true
//!
//! [tools]
//! azure_cli = "az"
//! terraform = "terraform"
//!
//! [events]
//! subscriber_buffer = 256
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default file name looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "onboard.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub deployments: DeploymentSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub events: EventSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Attach a permissive CORS layer to the router.
    #[serde(default = "default_true")]
    pub cors: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_true() -> bool {
    true
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSettings {
    /// Parent of every per-deployment working directory.
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    /// Directory holding the Terraform sources copied into each working directory.
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    #[serde(default = "default_template_files")]
    pub template_files: Vec<String>,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// Delete a deployment's working directory when the reaper evicts it.
    #[serde(default = "default_true")]
    pub remove_work_dirs: bool,
}

fn default_work_root() -> PathBuf {
    PathBuf::from("deployments")
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("terraform")
}

fn default_template_files() -> Vec<String> {
    [
        "variables.tf",
        "azure-roles.tf",
        "azure-audit-logs.tf",
        "outputs.tf",
        "main.tf",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_reap_interval_secs() -> u64 {
    300
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            template_dir: default_template_dir(),
            template_files: default_template_files(),
            retention_secs: default_retention_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            remove_work_dirs: true,
        }
    }
}

impl DeploymentSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Executables for the two external tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_azure_cli")]
    pub azure_cli: String,
    #[serde(default = "default_terraform")]
    pub terraform: String,
}

fn default_azure_cli() -> String {
    "az".to_string()
}

fn default_terraform() -> String {
    "terraform".to_string()
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            azure_cli: default_azure_cli(),
            terraform: default_terraform(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSettings {
    /// Queue depth per live-event subscriber; a full queue drops events for that subscriber.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_subscriber_buffer() -> usize {
    256
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse onboard.toml")
    }

    /// Load `path` if given, else `./onboard.toml` if present, else defaults.
    /// An explicitly named file must exist.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    ///
    /// Recognised: `PORT`, `ONBOARD_HOST`, `ONBOARD_WORK_ROOT`,
    /// `ONBOARD_TEMPLATE_DIR`, `ONBOARD_AZ_CMD`, `ONBOARD_TERRAFORM_CMD`.
    /// An unparseable `PORT` is ignored with a warning.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid PORT"),
            }
        }
        if let Some(host) = lookup("ONBOARD_HOST") {
            self.server.host = host;
        }
        if let Some(root) = lookup("ONBOARD_WORK_ROOT") {
            self.deployments.work_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup("ONBOARD_TEMPLATE_DIR") {
            self.deployments.template_dir = PathBuf::from(dir);
        }
        if let Some(cmd) = lookup("ONBOARD_AZ_CMD") {
            self.tools.azure_cli = cmd;
        }
        if let Some(cmd) = lookup("ONBOARD_TERRAFORM_CMD") {
            self.tools.terraform = cmd;
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
