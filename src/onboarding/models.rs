use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::InvalidDeploymentId;

// ── Identifiers ──────────────────────────────────────────────────────

/// Opaque deployment handle. Only canonical, hyphenated version-4 UUIDs
/// are accepted from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(Uuid);

impl DeploymentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DeploymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for DeploymentId {
    type Err = InvalidDeploymentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Uuid::parse_str also takes simple, braced and URN forms; reject those.
        if s.len() != 36 {
            return Err(InvalidDeploymentId);
        }
        let uuid = Uuid::parse_str(s).map_err(|_| InvalidDeploymentId)?;
        if uuid.get_version() != Some(uuid::Version::Random) {
            return Err(InvalidDeploymentId);
        }
        Ok(Self(uuid))
    }
}

// ── Status state machine ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Initializing,
    Configuring,
    AzureConfigured,
    TerraformInitialized,
    TerraformValidated,
    TerraformPlanned,
    TerraformApplied,
    Completed,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Configuring => "configuring",
            Self::AzureConfigured => "azure_configured",
            Self::TerraformInitialized => "terraform_initialized",
            Self::TerraformValidated => "terraform_validated",
            Self::TerraformPlanned => "terraform_planned",
            Self::TerraformApplied => "terraform_applied",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position along the linear pipeline. `Failed` has no position.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Initializing => Some(0),
            Self::Configuring => Some(1),
            Self::AzureConfigured => Some(2),
            Self::TerraformInitialized => Some(3),
            Self::TerraformValidated => Some(4),
            Self::TerraformPlanned => Some(5),
            Self::TerraformApplied => Some(6),
            Self::Completed => Some(7),
            Self::Failed => None,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "configuring" => Ok(Self::Configuring),
            "azure_configured" => Ok(Self::AzureConfigured),
            "terraform_initialized" => Ok(Self::TerraformInitialized),
            "terraform_validated" => Ok(Self::TerraformValidated),
            "terraform_planned" => Ok(Self::TerraformPlanned),
            "terraform_applied" => Ok(Self::TerraformApplied),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

// ── Onboarding configuration ─────────────────────────────────────────

/// Cortex Cloud feature toggles. Unset toggles take the per-feature default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    #[serde(default)]
    pub cloud_visibility: Option<bool>,
    #[serde(default)]
    pub agentless_scanning: Option<bool>,
    #[serde(default)]
    pub serverless_scanning: Option<bool>,
    #[serde(default)]
    pub agent_based_protection: Option<bool>,
    #[serde(default)]
    pub remediation: Option<bool>,
}

impl Features {
    /// Every toggle explicitly set to `enabled`.
    pub fn all(enabled: bool) -> Self {
        Self {
            cloud_visibility: Some(enabled),
            agentless_scanning: Some(enabled),
            serverless_scanning: Some(enabled),
            agent_based_protection: Some(enabled),
            remediation: Some(enabled),
        }
    }

    pub fn cloud_visibility(&self) -> bool {
        self.cloud_visibility.unwrap_or(true)
    }

    pub fn agentless_scanning(&self) -> bool {
        self.agentless_scanning.unwrap_or(true)
    }

    pub fn serverless_scanning(&self) -> bool {
        self.serverless_scanning.unwrap_or(true)
    }

    pub fn agent_based_protection(&self) -> bool {
        self.agent_based_protection.unwrap_or(false)
    }

    pub fn remediation(&self) -> bool {
        self.remediation.unwrap_or(false)
    }
}

/// Validated request body of `POST /api/start-onboarding`. Immutable once a
/// deployment owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingConfig {
    pub subscription_id: String,
    pub tenant_id: String,
    pub app_name: String,
    pub cortex_api_url: String,
    pub cortex_access_key: String,
    pub cortex_secret_key: String,
    pub azure_account_name: String,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub monitor_flow_logs: Option<bool>,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_region")]
    pub azure_region: String,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_region() -> String {
    "eastus".to_string()
}

fn default_log_retention_days() -> u32 {
    30
}

impl OnboardingConfig {
    pub fn monitor_flow_logs(&self) -> bool {
        self.monitor_flow_logs.unwrap_or(true)
    }
}

// ── Deployment state ─────────────────────────────────────────────────

/// One onboarding attempt.
///
/// `end_time` is set exactly once, on the transition into `Completed` or
/// `Failed`; from then on exactly one of `output`/`error` is populated.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: DeploymentId,
    pub config: OnboardingConfig,
    pub work_dir: PathBuf,
    status: DeploymentStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    output: Option<serde_json::Value>,
    error: Option<String>,
}

impl Deployment {
    pub fn new(id: DeploymentId, config: OnboardingConfig, work_dir: PathBuf) -> Self {
        Self {
            id,
            config,
            work_dir,
            status: DeploymentStatus::Initializing,
            start_time: Utc::now(),
            end_time: None,
            output: None,
            error: None,
        }
    }

    pub fn status(&self) -> DeploymentStatus {
        self.status
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn output(&self) -> Option<&serde_json::Value> {
        self.output.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// Move forward to a non-terminal pipeline status. Returns `false` (and
    /// leaves the deployment untouched) for regressions, terminal targets,
    /// or a deployment that already finished.
    pub fn advance(&mut self, next: DeploymentStatus) -> bool {
        if self.is_finished() || next.is_terminal() {
            return false;
        }
        match (self.status.rank(), next.rank()) {
            (Some(current), Some(target)) if target > current => {
                self.status = next;
                true
            }
            _ => false,
        }
    }

    /// Terminal success. No-op if the deployment already finished.
    pub fn complete(&mut self, output: serde_json::Value, at: DateTime<Utc>) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = DeploymentStatus::Completed;
        self.end_time = Some(at.max(self.start_time));
        self.output = Some(output);
        self.error = None;
        true
    }

    /// Terminal failure. No-op if the deployment already finished.
    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = DeploymentStatus::Failed;
        self.end_time = Some(at.max(self.start_time));
        self.output = None;
        self.error = Some(error.into());
        true
    }

    pub fn snapshot(&self) -> DeploymentSnapshot {
        DeploymentSnapshot {
            deployment_id: self.id,
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            output: self.output.clone(),
            error: self.error.clone(),
        }
    }
}

/// Point-in-time view returned by `GET /api/deployment/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSnapshot {
    pub deployment_id: DeploymentId,
    pub status: DeploymentStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Response body of `POST /api/start-onboarding`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedDeployment {
    pub deployment_id: DeploymentId,
    pub message: String,
    pub ws_url: String,
}

impl StartedDeployment {
    pub fn new(deployment_id: DeploymentId) -> Self {
        Self {
            deployment_id,
            message: "Deployment started".to_string(),
            ws_url: format!("/ws/{}", deployment_id),
        }
    }
}
