use async_trait::async_trait;
use uuid::Uuid;

use crate::database::manager::DatabaseError;
use crate::database::models::{CollectionProgress, MigrationRecord, Organization};
use crate::types::{DatastoreLocation, MigrationDirection};

/// Outcome of a checkpoint write
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressAck {
    Applied,
    /// Another writer already stored progress at least this far along
    Superseded(CollectionProgress),
}

/// Durable store of migration records.
///
/// `update` is optimistic-concurrency guarded on `version`: the stored version
/// must equal the caller's, the stored record must not be terminal, and the
/// status change must be a legal forward transition. Otherwise `Conflict`.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Insert a new record. Fails with `Conflict` while another non-terminal
    /// record exists for the same organization.
    async fn create(&self, record: &MigrationRecord) -> Result<MigrationRecord, DatabaseError>;

    /// Latest record for the organization (by start time)
    async fn get(&self, org_id: &str) -> Result<MigrationRecord, DatabaseError>;

    async fn get_by_id(&self, id: Uuid) -> Result<MigrationRecord, DatabaseError>;

    async fn find_active(&self, org_id: &str) -> Result<Option<MigrationRecord>, DatabaseError>;

    async fn latest_failed(
        &self,
        org_id: &str,
        direction: MigrationDirection,
    ) -> Result<Option<MigrationRecord>, DatabaseError>;

    /// Returns the stored record with its bumped version
    async fn update(&self, record: &MigrationRecord) -> Result<MigrationRecord, DatabaseError>;

    /// Atomically write one collection checkpoint while the record is InProgress
    async fn record_progress(
        &self,
        id: Uuid,
        collection: &str,
        progress: &CollectionProgress,
    ) -> Result<ProgressAck, DatabaseError>;

    /// Swap the organization's datastore pointer to `pointer`, clear its write
    /// freeze and mark the record Completed, all in one atomic update.
    async fn commit_cutover(
        &self,
        record: &MigrationRecord,
        pointer: &DatastoreLocation,
    ) -> Result<MigrationRecord, DatabaseError>;
}

/// The organization collaborator
#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    async fn get(&self, org_id: &str) -> Result<Organization, DatabaseError>;

    async fn set_write_frozen(&self, org_id: &str, frozen: bool) -> Result<(), DatabaseError>;

    /// An organization other than `org_id` whose dedicated pointer names the
    /// same database as `location`
    async fn dedicated_owner(
        &self,
        location: &DatastoreLocation,
        org_id: &str,
    ) -> Result<Option<String>, DatabaseError>;
}
