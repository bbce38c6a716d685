use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::database::manager::DatabaseError;
use crate::types::{DatastoreKind, DatastoreLocation, MigrationDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    ReadyForCutover,
    Completed,
    Failed,
    Aborted,
}

impl MigrationStatus {
    pub const ACTIVE: [MigrationStatus; 3] = [
        MigrationStatus::Pending,
        MigrationStatus::InProgress,
        MigrationStatus::ReadyForCutover,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::InProgress => "in_progress",
            MigrationStatus::ReadyForCutover => "ready_for_cutover",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MigrationStatus::Pending),
            "in_progress" => Some(MigrationStatus::InProgress),
            "ready_for_cutover" => Some(MigrationStatus::ReadyForCutover),
            "completed" => Some(MigrationStatus::Completed),
            "failed" => Some(MigrationStatus::Failed),
            "aborted" => Some(MigrationStatus::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Aborted
        )
    }

    /// Forward-only state machine. InProgress -> Completed is the dry-run exit.
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        match (self, next) {
            (Pending, InProgress) => true,
            (InProgress, ReadyForCutover) | (InProgress, Completed) => true,
            (ReadyForCutover, Completed) => true,
            (from, Failed) | (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Resumability checkpoint for one collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionProgress {
    pub total: u64,
    pub copied: u64,
    pub last_id: Option<String>,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub id: Uuid,
    pub org_id: String,
    pub direction: MigrationDirection,
    pub status: MigrationStatus,
    pub source: DatastoreLocation,
    pub target: DatastoreLocation,
    pub dry_run: bool,
    pub chunk_size: u32,
    pub resume_requested: bool,
    pub allow_legal_hold_override: bool,
    pub actor_id: Option<String>,
    pub collections_progress: BTreeMap<String, CollectionProgress>,
    pub error_message: Option<String>,
    pub resumed_from: Option<Uuid>,
    pub version: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub aborted_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

/// Options carried from a start request onto a new record
#[derive(Debug, Clone, Default)]
pub struct MigrationOptions {
    pub dry_run: bool,
    pub chunk_size: u32,
    pub resume_requested: bool,
    pub allow_legal_hold_override: bool,
    pub actor_id: Option<String>,
}

impl MigrationRecord {
    pub fn pending(
        org_id: impl Into<String>,
        direction: MigrationDirection,
        source: DatastoreLocation,
        target: DatastoreLocation,
        options: MigrationOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: org_id.into(),
            direction,
            status: MigrationStatus::Pending,
            source,
            target,
            dry_run: options.dry_run,
            chunk_size: options.chunk_size,
            resume_requested: options.resume_requested,
            allow_legal_hold_override: options.allow_legal_hold_override,
            actor_id: options.actor_id,
            collections_progress: BTreeMap::new(),
            error_message: None,
            resumed_from: None,
            version: 0,
            started_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            aborted_at: None,
            last_progress_at: None,
        }
    }

    /// Seed checkpoints from a failed attempt so a resumed run continues from its cursors
    pub fn resuming(mut self, failed: &MigrationRecord) -> Self {
        self.resumed_from = Some(failed.id);
        self.collections_progress = failed.collections_progress.clone();
        self
    }

    /// Apply a status change, stamping the matching timestamp
    pub fn transition(&mut self, next: MigrationStatus) -> Result<(), DatabaseError> {
        if !self.status.can_transition_to(next) {
            return Err(DatabaseError::Conflict(format!(
                "migration {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        let now = Utc::now();
        match next {
            MigrationStatus::Completed => self.completed_at = Some(now),
            MigrationStatus::Failed => self.failed_at = Some(now),
            MigrationStatus::Aborted => self.aborted_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn all_collections_done(&self) -> bool {
        !self.collections_progress.is_empty() && self.collections_progress.values().all(|p| p.done)
    }

    pub fn total_copied(&self) -> u64 {
        self.collections_progress.values().map(|p| p.copied).sum()
    }
}

/// Row shape of the tenant_migrations table
#[derive(Debug, FromRow)]
pub struct MigrationRow {
    pub id: Uuid,
    pub org_id: String,
    pub direction: String,
    pub status: String,
    pub source_kind: String,
    pub source_uri: String,
    pub source_db_name: Option<String>,
    pub target_kind: String,
    pub target_uri: String,
    pub target_db_name: Option<String>,
    pub dry_run: bool,
    pub chunk_size: i32,
    pub resume_requested: bool,
    pub allow_legal_hold_override: bool,
    pub actor_id: Option<String>,
    pub progress: Json<BTreeMap<String, CollectionProgress>>,
    pub error_message: Option<String>,
    pub resumed_from: Option<Uuid>,
    pub version: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub aborted_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl TryFrom<MigrationRow> for MigrationRecord {
    type Error = DatabaseError;

    fn try_from(row: MigrationRow) -> Result<Self, Self::Error> {
        let bad = |field: &str, value: &str| DatabaseError::QueryError(format!("invalid {} '{}'", field, value));
        Ok(MigrationRecord {
            id: row.id,
            direction: MigrationDirection::parse(&row.direction).ok_or_else(|| bad("direction", &row.direction))?,
            status: MigrationStatus::parse(&row.status).ok_or_else(|| bad("status", &row.status))?,
            source: DatastoreLocation::new(
                DatastoreKind::parse(&row.source_kind).ok_or_else(|| bad("source_kind", &row.source_kind))?,
                row.source_uri,
                row.source_db_name,
            ),
            target: DatastoreLocation::new(
                DatastoreKind::parse(&row.target_kind).ok_or_else(|| bad("target_kind", &row.target_kind))?,
                row.target_uri,
                row.target_db_name,
            ),
            org_id: row.org_id,
            dry_run: row.dry_run,
            chunk_size: u32::try_from(row.chunk_size).map_err(|_| bad("chunk_size", &row.chunk_size.to_string()))?,
            resume_requested: row.resume_requested,
            allow_legal_hold_override: row.allow_legal_hold_override,
            actor_id: row.actor_id,
            collections_progress: row.progress.0,
            error_message: row.error_message,
            resumed_from: row.resumed_from,
            version: row.version,
            started_at: row.started_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            aborted_at: row.aborted_at,
            last_progress_at: row.last_progress_at,
        })
    }
}
