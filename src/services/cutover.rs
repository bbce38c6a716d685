use std::sync::Arc;
use tracing::{error, info, warn};

use crate::database::catalog::CollectionCatalog;
use crate::database::datastore::Datastore;
use crate::database::manager::DatabaseError;
use crate::database::models::{MigrationRecord, MigrationStatus};
use crate::database::store::{MigrationStore, OrganizationDirectory};
use crate::services::error::MigrationError;
use crate::services::locks::TenantLocks;

/// Switches an organization's authoritative datastore once its copy has been verified.
///
/// Runs entirely under the organization's tenant lock. Any failure leaves the
/// source authoritative and writable: the freeze is only kept when the pointer
/// swap commits, and that commit clears it in the same update.
pub struct CutoverController {
    store: Arc<dyn MigrationStore>,
    directory: Arc<dyn OrganizationDirectory>,
    source: Arc<dyn Datastore>,
    target: Arc<dyn Datastore>,
    catalog: CollectionCatalog,
    locks: TenantLocks,
}

impl CutoverController {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        directory: Arc<dyn OrganizationDirectory>,
        source: Arc<dyn Datastore>,
        target: Arc<dyn Datastore>,
        catalog: CollectionCatalog,
        locks: TenantLocks,
    ) -> Self {
        Self {
            store,
            directory,
            source,
            target,
            catalog,
            locks,
        }
    }

    pub async fn run(&self, record: MigrationRecord) -> Result<MigrationRecord, MigrationError> {
        if record.status != MigrationStatus::ReadyForCutover {
            return Err(MigrationError::conflict(format!(
                "Migration is {}, not ready_for_cutover",
                record.status.as_str()
            )));
        }

        let org_id = record.org_id.clone();
        let _guard = self.locks.acquire(&org_id).await;

        self.verify(&record).await?;

        if let Err(e) = self.directory.set_write_frozen(&org_id, true).await {
            error!("Failed to freeze writes for org {}: {}", org_id, e);
            return Err(MigrationError::fatal(format!(
                "Failed to freeze writes for organization {}",
                org_id
            )));
        }
        info!("Writes frozen for org {}", org_id);

        // Writes may have landed between the first check and the freeze
        if let Err(e) = self.verify(&record).await {
            self.unfreeze(&org_id).await;
            return Err(e);
        }

        match self.store.commit_cutover(&record, &record.target).await {
            Ok(completed) => {
                info!(
                    "Org {} now served from {} (migration {})",
                    org_id, completed.target, completed.id
                );
                Ok(completed)
            }
            Err(DatabaseError::Conflict(message)) => {
                warn!("Cutover for org {} lost a concurrent update: {}", org_id, message);
                self.unfreeze(&org_id).await;
                Err(MigrationError::Conflict(message))
            }
            Err(e) => {
                error!("Pointer swap failed for org {}: {}", org_id, e);
                self.unfreeze(&org_id).await;
                self.mark_failed(record, &e.to_string()).await;
                Err(MigrationError::fatal(format!(
                    "Cutover failed for organization {}; source datastore remains authoritative",
                    org_id
                )))
            }
        }
    }

    /// Source count must equal both the recorded copy count and the target count
    async fn verify(&self, record: &MigrationRecord) -> Result<(), MigrationError> {
        for (name, progress) in &record.collections_progress {
            let spec = self.catalog.get(name).ok_or_else(|| {
                MigrationError::fatal(format!("Collection '{}' is not in the catalog", name))
            })?;
            let source_count = self.source.count(spec, &record.org_id).await?;
            if source_count != progress.copied {
                return Err(MigrationError::VerificationFailed {
                    collection: name.clone(),
                    expected: source_count,
                    actual: progress.copied,
                });
            }
            let target_count = self.target.count(spec, &record.org_id).await?;
            if target_count != source_count {
                return Err(MigrationError::VerificationFailed {
                    collection: name.clone(),
                    expected: source_count,
                    actual: target_count,
                });
            }
        }
        Ok(())
    }

    async fn unfreeze(&self, org_id: &str) {
        match self.directory.set_write_frozen(org_id, false).await {
            Ok(()) => info!("Writes unfrozen for org {}", org_id),
            Err(e) => error!(
                "Failed to unfreeze writes for org {}: {}; manual unfreeze required",
                org_id, e
            ),
        }
    }

    async fn mark_failed(&self, mut record: MigrationRecord, reason: &str) {
        if record.transition(MigrationStatus::Failed).is_err() {
            return;
        }
        record.error_message = Some(format!("Cutover failed: {}", reason));
        if let Err(e) = self.store.update(&record).await {
            error!("Failed to mark migration {} as failed: {}", record.id, e);
        }
    }
}
