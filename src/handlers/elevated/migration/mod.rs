// handlers/elevated/migration/mod.rs - Tenant migration handlers
//
// Move an organization between the shared datastore and a dedicated one.
// Every route requires a JWT whose role carries the MigrateTenants capability.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::database::models::{CollectionProgress, MigrationRecord};

pub mod abort;    // POST /api/migration/abort
pub mod finalize; // POST /api/migration/finalize
pub mod start;    // POST /api/migration/start
pub mod status;   // GET /api/migration/status/:org_id

pub use abort::migration_abort;
pub use finalize::migration_finalize;
pub use start::migration_start;
pub use status::migration_status;

/// Client-facing projection of a migration record. Datastore locations are
/// rendered without credentials.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationView {
    pub migration_id: Uuid,
    pub org_id: String,
    pub direction: &'static str,
    pub status: &'static str,
    pub source: String,
    pub target: String,
    pub dry_run: bool,
    pub chunk_size: u32,
    pub resume_requested: bool,
    pub allow_legal_hold_override: bool,
    pub actor_id: Option<String>,
    pub collections_progress: BTreeMap<String, CollectionProgress>,
    pub total_copied: u64,
    pub error_message: Option<String>,
    pub resumed_from: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub aborted_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl From<MigrationRecord> for MigrationView {
    fn from(record: MigrationRecord) -> Self {
        Self {
            migration_id: record.id,
            total_copied: record.total_copied(),
            org_id: record.org_id,
            direction: record.direction.as_str(),
            status: record.status.as_str(),
            source: record.source.to_string(),
            target: record.target.to_string(),
            dry_run: record.dry_run,
            chunk_size: record.chunk_size,
            resume_requested: record.resume_requested,
            allow_legal_hold_override: record.allow_legal_hold_override,
            actor_id: record.actor_id,
            collections_progress: record.collections_progress,
            error_message: record.error_message,
            resumed_from: record.resumed_from,
            started_at: record.started_at,
            completed_at: record.completed_at,
            failed_at: record.failed_at,
            aborted_at: record.aborted_at,
            last_progress_at: record.last_progress_at,
        }
    }
}
