//! Status Query Service.

use super::models::{DeploymentId, DeploymentSnapshot};
use super::registry::Registry;
use crate::errors::StatusError;

/// Snapshot of the deployment named by `raw_id`, read under its lock.
///
/// Malformed ids are rejected before the registry is touched. A deployment
/// evicted while this query waited for the lock yields `NotFound`.
pub async fn query_status(registry: &Registry, raw_id: &str) -> Result<DeploymentSnapshot, StatusError> {
    let id: DeploymentId = raw_id.parse()?;
    registry
        .with_lock(&id, |locked| locked.deployment().map(|d| d.snapshot()))
        .await
        .flatten()
        .ok_or(StatusError::NotFound)
}
