use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-organization mutual exclusion.
///
/// Cutover holds the guard across freeze, pointer swap and unfreeze; the
/// tenant write path takes the same guard so it never sees a torn state.
#[derive(Clone, Default)]
pub struct TenantLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, org_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(org_id.to_string()).or_default().clone()
    }

    pub async fn acquire(&self, org_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(org_id).await.lock_owned().await
    }

    /// None while another holder has the organization locked
    pub async fn try_acquire(&self, org_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(org_id).await.try_lock_owned().ok()
    }
}
