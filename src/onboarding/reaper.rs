//! Periodic eviction of finished deployments.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::models::{Deployment, DeploymentId};
use super::registry::Registry;
use crate::config::DeploymentSettings;

/// What the reaper does on each pass.
#[derive(Debug, Clone)]
pub struct ReaperPolicy {
    /// Minimum age past `end_time` before a deployment is evicted.
    pub retention: Duration,
    /// Delete the evicted deployment's working directory.
    pub remove_work_dirs: bool,
}

impl From<&DeploymentSettings> for ReaperPolicy {
    fn from(settings: &DeploymentSettings) -> Self {
        Self {
            retention: settings.retention(),
            remove_work_dirs: settings.remove_work_dirs,
        }
    }
}

/// Whether `deployment` is past retention at `now`. Deployments that have
/// not finished are never expired, however old.
pub fn is_expired(deployment: &Deployment, now: DateTime<Utc>, retention: Duration) -> bool {
    let Some(end) = deployment.end_time() else {
        return false;
    };
    match (now - end).to_std() {
        Ok(age) => age > retention,
        // `now` precedes `end_time`
        Err(_) => false,
    }
}

/// One reaper pass. Evicts every deployment whose `now - end_time` exceeds
/// the retention window and returns the evicted ids.
///
/// Each eviction happens under the deployment's lock, so a concurrent
/// status read sees either the whole deployment or none of it.
pub async fn reap_expired(
    registry: &Registry,
    now: DateTime<Utc>,
    policy: &ReaperPolicy,
) -> Vec<DeploymentId> {
    let candidates: Vec<DeploymentId> = registry
        .ids()
        .into_iter()
        .filter(|id| {
            registry
                .get(id)
                .is_some_and(|d| is_expired(&d, now, policy.retention))
        })
        .collect();

    let mut evicted = Vec::with_capacity(candidates.len());
    for id in candidates {
        let removed = match registry.with_lock(&id, |locked| locked.remove()).await {
            Some(removed) => removed,
            None => {
                tracing::warn!(deployment_id = %id, "Deployment has no lock entry, removing directly");
                registry.remove_unlocked(&id)
            }
        };
        let Some(deployment) = removed else {
            continue;
        };
        tracing::info!(deployment_id = %id, status = %deployment.status(), "Evicted deployment");
        if policy.remove_work_dirs {
            remove_work_dir(&id, &deployment.work_dir).await;
        }
        evicted.push(id);
    }
    evicted
}

async fn remove_work_dir(id: &DeploymentId, work_dir: &Path) {
    match tokio::fs::remove_dir_all(work_dir).await {
        Ok(()) => tracing::debug!(deployment_id = %id, path = %work_dir.display(), "Removed working directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            deployment_id = %id,
            path = %work_dir.display(),
            error = %e,
            "Failed to remove working directory"
        ),
    }
}

/// Run [`reap_expired`] every `interval` until the task is aborted.
pub async fn run_reaper(registry: Arc<Registry>, interval: Duration, policy: ReaperPolicy) {
    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately; nothing can have expired yet.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let evicted = reap_expired(&registry, Utc::now(), &policy).await;
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), remaining = registry.len(), "Reaper pass complete");
        }
    }
}
