//! In-memory deployment registry.
//!
//! Holds every live [`Deployment`] plus one async lock per deployment. Both
//! maps sit behind a single `std::sync::Mutex`, so an id can never be seen
//! with an entry but without its lock or the reverse. Critical sections on
//! that mutex are short and never span an `.await`.
//!
//! Locking discipline:
//! - The orchestrator is the only writer of a deployment's lifecycle fields
//!   and goes through [`Registry::update`] without taking the per-deployment
//!   lock.
//! - Status reads and reaper deletes go through [`Registry::with_lock`], which
//!   serializes them per deployment. At most one per-deployment lock is held
//!   at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::models::{Deployment, DeploymentId};

type DeploymentLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
struct Inner {
    deployments: HashMap<DeploymentId, Deployment>,
    locks: HashMap<DeploymentId, DeploymentLock>,
}

/// Process-wide deployment state. Construct once and share behind an `Arc`.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        // Each map operation is a single insert/remove; a panic elsewhere
        // cannot leave them half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a deployment together with its lock. Returns `false` and
    /// changes nothing if the id is already registered.
    pub fn create(&self, deployment: Deployment) -> bool {
        let mut inner = self.inner();
        let id = deployment.id;
        if inner.deployments.contains_key(&id) {
            return false;
        }
        inner.deployments.insert(id, deployment);
        inner.locks.insert(id, Arc::new(tokio::sync::Mutex::new(())));
        true
    }

    /// Unlocked copy of a deployment's current state.
    pub fn get(&self, id: &DeploymentId) -> Option<Deployment> {
        self.inner().deployments.get(id).cloned()
    }

    pub fn contains(&self, id: &DeploymentId) -> bool {
        self.inner().deployments.contains_key(id)
    }

    /// Mutate a deployment in place without the per-deployment lock.
    /// Reserved for the orchestrator, the single writer of its own entry.
    /// Returns `None` if the deployment is gone.
    pub fn update<R>(&self, id: &DeploymentId, f: impl FnOnce(&mut Deployment) -> R) -> Option<R> {
        self.inner().deployments.get_mut(id).map(f)
    }

    /// Ids of every registered deployment.
    pub fn ids(&self) -> Vec<DeploymentId> {
        self.inner().deployments.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner().deployments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a lock entry exists for `id`.
    pub fn has_lock(&self, id: &DeploymentId) -> bool {
        self.inner().locks.contains_key(id)
    }

    /// Run `f` while holding the deployment's lock.
    ///
    /// Returns `None` when no lock is registered for `id`. The lock is
    /// released on every exit path, including a panic inside `f`. If the
    /// entry was removed while this call waited for the lock, `f` sees
    /// [`Locked::deployment`] return `None`.
    pub async fn with_lock<R>(
        &self,
        id: &DeploymentId,
        f: impl FnOnce(Locked<'_>) -> R,
    ) -> Option<R> {
        let lock = self.inner().locks.get(id).cloned()?;
        let _guard = lock.lock().await;
        let inner = self.inner();
        Some(f(Locked { id: *id, inner }))
    }

    /// Delete a deployment that has no lock entry. Returns the removed state.
    pub(crate) fn remove_unlocked(&self, id: &DeploymentId) -> Option<Deployment> {
        let mut inner = self.inner();
        inner.locks.remove(id);
        inner.deployments.remove(id)
    }
}

/// Registry view handed to [`Registry::with_lock`] callbacks.
pub struct Locked<'a> {
    id: DeploymentId,
    inner: MutexGuard<'a, Inner>,
}

impl Locked<'_> {
    pub fn deployment(&self) -> Option<&Deployment> {
        self.inner.deployments.get(&self.id)
    }

    /// Remove both the deployment and its lock entry.
    pub fn remove(mut self) -> Option<Deployment> {
        self.inner.locks.remove(&self.id);
        self.inner.deployments.remove(&self.id)
    }
}
