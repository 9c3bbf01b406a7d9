//! Field-level checks applied to an [`OnboardingConfig`] before any
//! deployment state is created. Every rule runs; all failures are reported
//! together.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use super::models::OnboardingConfig;
use crate::errors::ValidationErrors;

pub const MIN_LOG_RETENTION_DAYS: u32 = 1;
pub const MAX_LOG_RETENTION_DAYS: u32 = 730;

static APP_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"));
static ENVIRONMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]{1,32}$").expect("valid regex"));
static REGION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]{1,64}$").expect("valid regex"));
static HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://[A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?(:[0-9]{1,5})?(/[^\s]*)?$")
        .expect("valid regex")
});

/// Validate an onboarding configuration. Field names in the returned errors
/// use the camelCase request keys.
pub fn validate(config: &OnboardingConfig) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();

    check_uuid(&mut errors, "subscriptionId", &config.subscription_id);
    check_uuid(&mut errors, "tenantId", &config.tenant_id);

    if !APP_NAME_RE.is_match(&config.app_name) {
        errors.push(
            "appName",
            "must be 1-64 characters of letters, digits, '-' or '_'",
        );
    }

    if !HOST_RE.is_match(&config.cortex_api_url) {
        errors.push("cortexApiUrl", "must be an https:// URL");
    }

    check_credential(&mut errors, "cortexAccessKey", &config.cortex_access_key);
    check_credential(&mut errors, "cortexSecretKey", &config.cortex_secret_key);

    let account = config.azure_account_name.trim();
    if account.is_empty() || config.azure_account_name.chars().count() > 128 {
        errors.push("azureAccountName", "must be 1-128 characters");
    } else if config
        .azure_account_name
        .chars()
        .any(|c| c.is_control() || c == '"' || c == '\\')
    {
        errors.push(
            "azureAccountName",
            "must not contain quotes, backslashes or control characters",
        );
    }

    if !ENVIRONMENT_RE.is_match(&config.environment) {
        errors.push(
            "environment",
            "must be 1-32 lowercase letters, digits or '-'",
        );
    }

    if !REGION_RE.is_match(&config.azure_region) {
        errors.push(
            "azureRegion",
            "must be an Azure region name such as 'eastus'",
        );
    }

    if !(MIN_LOG_RETENTION_DAYS..=MAX_LOG_RETENTION_DAYS).contains(&config.log_retention_days) {
        errors.push(
            "logRetentionDays",
            format!(
                "must be between {} and {}",
                MIN_LOG_RETENTION_DAYS, MAX_LOG_RETENTION_DAYS
            ),
        );
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn check_uuid(errors: &mut ValidationErrors, field: &str, value: &str) {
    if value.len() != 36 || Uuid::parse_str(value).is_err() {
        errors.push(field, "must be a UUID (xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx)");
    }
}

fn check_credential(errors: &mut ValidationErrors, field: &str, value: &str) {
    if value.is_empty() {
        errors.push(field, "is required");
    } else if value.len() > 512 {
        errors.push(field, "must be at most 512 characters");
    } else if value
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '"' || c == '\\')
    {
        errors.push(
            field,
            "must not contain whitespace, quotes or backslashes",
        );
    }
}
