//! Typed error hierarchy for the onboarding service.
//!
//! - `CommandError`: a single external command failed to spawn, exited
//!   non-zero, or broke its pipes.
//! - `DeploymentError`: anything that aborts a deployment's step sequence.
//! - `StatusError`: a status query named a malformed or unknown id.
//! - `ValidationErrors`: field-level rejection of an onboarding config.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Errors from running one external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed with code {}: {stderr}", display_code(.code))]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

impl CommandError {
    /// Exit code of a command that ran to completion, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NonZeroExit { code, .. } => *code,
            _ => None,
        }
    }
}

/// Errors that abort a deployment. The `Display` text is what ends up in the
/// deployment's `error` field and in the terminal `error` event.
#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("Failed to create working directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to copy template {file} into working directory: {source}")]
    TemplateCopy {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write terraform.tfvars at {path}: {source}")]
    Render {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Failed to parse terraform outputs: {0}")]
    OutputParse(#[source] serde_json::Error),

    #[error("Terraform reported no outputs")]
    NoOutputs,

    #[error("Deployment task aborted unexpectedly: {0}")]
    Aborted(String),
}

/// A malformed deployment identifier was presented at an entry point.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid deployment ID format")]
pub struct InvalidDeploymentId;

/// Why a status query produced no snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error(transparent)]
    InvalidId(#[from] InvalidDeploymentId),

    #[error("Deployment not found")]
    NotFound,
}

/// One rejected field of an onboarding configuration.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Every field-level problem found in an onboarding configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: {}", self.summary())
    }
}

impl std::error::Error for ValidationErrors {}

impl ValidationErrors {
    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Whether `field` was among the rejected fields.
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
