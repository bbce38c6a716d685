use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{Executor, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::database::manager::DatabaseError;
use crate::database::models::{
    CollectionProgress, MigrationRecord, MigrationRow, MigrationStatus, Organization, OrganizationRow,
};
use crate::database::store::{MigrationStore, OrganizationDirectory, ProgressAck};
use crate::types::{DatastoreLocation, MigrationDirection};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS organizations (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    legal_hold BOOLEAN NOT NULL DEFAULT false,
    archived_at TIMESTAMPTZ,
    datastore_kind TEXT NOT NULL DEFAULT 'shared',
    database_uri TEXT,
    database_name TEXT,
    write_frozen BOOLEAN NOT NULL DEFAULT false,
    last_migrated_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS tenant_migrations (
    id UUID PRIMARY KEY,
    org_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    status TEXT NOT NULL,
    source_kind TEXT NOT NULL,
    source_uri TEXT NOT NULL,
    source_db_name TEXT,
    target_kind TEXT NOT NULL,
    target_uri TEXT NOT NULL,
    target_db_name TEXT,
    dry_run BOOLEAN NOT NULL DEFAULT false,
    chunk_size INTEGER NOT NULL DEFAULT 100,
    resume_requested BOOLEAN NOT NULL DEFAULT false,
    allow_legal_hold_override BOOLEAN NOT NULL DEFAULT false,
    actor_id TEXT,
    progress JSONB NOT NULL DEFAULT '{}'::jsonb,
    error_message TEXT,
    resumed_from UUID,
    version BIGINT NOT NULL DEFAULT 0,
    started_at TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ,
    failed_at TIMESTAMPTZ,
    aborted_at TIMESTAMPTZ,
    last_progress_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_tenant_migrations_org ON tenant_migrations (org_id, started_at DESC);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tenant_migrations_one_active ON tenant_migrations (org_id)
    WHERE status IN ('pending', 'in_progress', 'ready_for_cutover');

CREATE TABLE IF NOT EXISTS audit_log (
    id BIGSERIAL PRIMARY KEY,
    action TEXT NOT NULL,
    org_id TEXT NOT NULL,
    actor_id TEXT,
    detail JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL
);
"#;

const SELECT_MIGRATION: &str = r#"
    SELECT id, org_id, direction, status,
           source_kind, source_uri, source_db_name,
           target_kind, target_uri, target_db_name,
           dry_run, chunk_size, resume_requested, allow_legal_hold_override,
           actor_id, progress, error_message, resumed_from, version,
           started_at, completed_at, failed_at, aborted_at, last_progress_at
    FROM tenant_migrations
"#;

/// System database store: migration records and the organization directory
/// live side by side so cutover can commit both in one transaction.
#[derive(Clone)]
pub struct PgSystemStore {
    pool: PgPool,
    shared: DatastoreLocation,
}

impl PgSystemStore {
    pub fn new(pool: PgPool, shared: DatastoreLocation) -> Self {
        Self { pool, shared }
    }

    /// Create tables and indexes if missing
    pub async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        // Multi-statement DDL goes through the simple query protocol
        self.pool.execute(SCHEMA).await?;
        info!("System schema verified");
        Ok(())
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        bind: &str,
    ) -> Result<Option<MigrationRecord>, DatabaseError> {
        let sql = format!("{} {} ORDER BY started_at DESC LIMIT 1", SELECT_MIGRATION, clause);
        let row = sqlx::query_as::<_, MigrationRow>(&sql)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await?;
        row.map(MigrationRecord::try_from).transpose()
    }

    /// Explain why a guarded update touched zero rows
    async fn conflict_for(&self, id: Uuid, expected_version: i64) -> DatabaseError {
        match self.get_by_id(id).await {
            Ok(stored) if stored.status.is_terminal() => DatabaseError::Conflict(format!(
                "migration {} is already {}",
                id,
                stored.status.as_str()
            )),
            Ok(stored) => DatabaseError::Conflict(format!(
                "migration {} was modified concurrently (expected version {}, found {})",
                id, expected_version, stored.version
            )),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl MigrationStore for PgSystemStore {
    async fn create(&self, record: &MigrationRecord) -> Result<MigrationRecord, DatabaseError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tenant_migrations (
                id, org_id, direction, status,
                source_kind, source_uri, source_db_name,
                target_kind, target_uri, target_db_name,
                dry_run, chunk_size, resume_requested, allow_legal_hold_override,
                actor_id, progress, error_message, resumed_from, version,
                started_at, completed_at, failed_at, aborted_at, last_progress_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, 0, $19, $20, $21, $22, $23)
            "#,
        )
        .bind(record.id)
        .bind(&record.org_id)
        .bind(record.direction.as_str())
        .bind(record.status.as_str())
        .bind(record.source.kind.as_str())
        .bind(&record.source.uri)
        .bind(&record.source.db_name)
        .bind(record.target.kind.as_str())
        .bind(&record.target.uri)
        .bind(&record.target.db_name)
        .bind(record.dry_run)
        .bind(record.chunk_size as i32)
        .bind(record.resume_requested)
        .bind(record.allow_legal_hold_override)
        .bind(&record.actor_id)
        .bind(Json(&record.collections_progress))
        .bind(&record.error_message)
        .bind(record.resumed_from)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.failed_at)
        .bind(record.aborted_at)
        .bind(record.last_progress_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.get_by_id(record.id).await,
            Err(e) if DatabaseError::is_unique_violation(&e) => Err(DatabaseError::Conflict(format!(
                "a migration is already active for organization {}",
                record.org_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, org_id: &str) -> Result<MigrationRecord, DatabaseError> {
        self.fetch_one_where("WHERE org_id = $1", org_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("no migration found for organization {}", org_id)))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<MigrationRecord, DatabaseError> {
        let sql = format!("{} WHERE id = $1", SELECT_MIGRATION);
        let row = sqlx::query_as::<_, MigrationRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("migration {} not found", id)))?;
        MigrationRecord::try_from(row)
    }

    async fn find_active(&self, org_id: &str) -> Result<Option<MigrationRecord>, DatabaseError> {
        self.fetch_one_where(
            "WHERE org_id = $1 AND status IN ('pending', 'in_progress', 'ready_for_cutover')",
            org_id,
        )
        .await
    }

    async fn latest_failed(
        &self,
        org_id: &str,
        direction: MigrationDirection,
    ) -> Result<Option<MigrationRecord>, DatabaseError> {
        let latest = match self.fetch_one_where("WHERE org_id = $1", org_id).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        Ok((latest.status == MigrationStatus::Failed && latest.direction == direction).then_some(latest))
    }

    async fn update(&self, record: &MigrationRecord) -> Result<MigrationRecord, DatabaseError> {
        // Only statuses the record may legally come from are accepted in the guard
        let allowed_from: Vec<&str> = [
            MigrationStatus::Pending,
            MigrationStatus::InProgress,
            MigrationStatus::ReadyForCutover,
        ]
        .iter()
        .filter(|from| **from == record.status || from.can_transition_to(record.status))
        .map(|s| s.as_str())
        .collect();

        let result = sqlx::query(
            r#"
            UPDATE tenant_migrations SET
                status = $3,
                progress = $4,
                error_message = $5,
                completed_at = $6,
                failed_at = $7,
                aborted_at = $8,
                last_progress_at = $9,
                resume_requested = $10,
                actor_id = $11,
                version = version + 1
            WHERE id = $1 AND version = $2 AND status = ANY($12)
            "#,
        )
        .bind(record.id)
        .bind(record.version)
        .bind(record.status.as_str())
        .bind(Json(&record.collections_progress))
        .bind(&record.error_message)
        .bind(record.completed_at)
        .bind(record.failed_at)
        .bind(record.aborted_at)
        .bind(record.last_progress_at)
        .bind(record.resume_requested)
        .bind(&record.actor_id)
        .bind(&allowed_from)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict_for(record.id, record.version).await);
        }
        self.get_by_id(record.id).await
    }

    async fn record_progress(
        &self,
        id: Uuid,
        collection: &str,
        progress: &CollectionProgress,
    ) -> Result<ProgressAck, DatabaseError> {
        // The copied guard keeps checkpoints monotonic when two drivers race
        let result = sqlx::query(
            r#"
            UPDATE tenant_migrations SET
                progress = jsonb_set(progress, ARRAY[$2::text], $3::jsonb, true),
                last_progress_at = $4,
                version = version + 1
            WHERE id = $1
            AND status = 'in_progress'
            AND COALESCE((progress -> $2 ->> 'copied')::bigint, 0) <= $5
            "#,
        )
        .bind(id)
        .bind(collection)
        .bind(Json(progress))
        .bind(Utc::now())
        .bind(progress.copied as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(ProgressAck::Applied);
        }

        let stored = self.get_by_id(id).await?;
        if stored.status != MigrationStatus::InProgress {
            return Err(DatabaseError::Conflict(format!(
                "migration {} is {}, progress not recorded",
                id,
                stored.status.as_str()
            )));
        }
        let current = stored.collections_progress.get(collection).cloned().unwrap_or_default();
        debug!("Progress for {}/{} superseded by concurrent writer", id, collection);
        Ok(ProgressAck::Superseded(current))
    }

    async fn commit_cutover(
        &self,
        record: &MigrationRecord,
        pointer: &DatastoreLocation,
    ) -> Result<MigrationRecord, DatabaseError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE tenant_migrations SET
                status = 'completed',
                completed_at = $3,
                last_progress_at = $3,
                version = version + 1
            WHERE id = $1 AND version = $2 AND status = 'ready_for_cutover'
            "#,
        )
        .bind(record.id)
        .bind(record.version)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Err(self.conflict_for(record.id, record.version).await);
        }

        let org_updated = sqlx::query(
            r#"
            UPDATE organizations SET
                datastore_kind = $2,
                database_uri = $3,
                database_name = $4,
                write_frozen = false,
                last_migrated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(&record.org_id)
        .bind(pointer.kind.as_str())
        .bind(&pointer.uri)
        .bind(&pointer.db_name)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if org_updated == 0 {
            tx.rollback().await?;
            return Err(DatabaseError::NotFound(format!("organization {} not found", record.org_id)));
        }

        tx.commit().await?;
        self.get_by_id(record.id).await
    }
}

#[async_trait]
impl OrganizationDirectory for PgSystemStore {
    async fn get(&self, org_id: &str) -> Result<Organization, DatabaseError> {
        let row = sqlx::query_as::<_, OrganizationRow>(
            r#"
            SELECT id, name, legal_hold, archived_at, datastore_kind,
                   database_uri, database_name, write_frozen, last_migrated_at
            FROM organizations
            WHERE id = $1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("organization {} not found", org_id)))?;
        row.into_organization(&self.shared)
    }

    async fn set_write_frozen(&self, org_id: &str, frozen: bool) -> Result<(), DatabaseError> {
        let updated = sqlx::query("UPDATE organizations SET write_frozen = $2 WHERE id = $1")
            .bind(org_id)
            .bind(frozen)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(DatabaseError::NotFound(format!("organization {} not found", org_id)));
        }
        Ok(())
    }

    async fn dedicated_owner(
        &self,
        location: &DatastoreLocation,
        org_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        // Pointers may name the database in database_name or in the uri path,
        // so candidates are narrowed in SQL and compared on resolved URLs here
        let rows = sqlx::query_as::<_, OrganizationRow>(
            r#"
            SELECT id, name, legal_hold, archived_at, datastore_kind,
                   database_uri, database_name, write_frozen, last_migrated_at
            FROM organizations
            WHERE datastore_kind = 'dedicated'
            AND id <> $1
            AND ($2::text IS NULL OR database_name IS NULL OR database_name = $2)
            "#,
        )
        .bind(org_id)
        .bind(location.db_name.as_deref())
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let org = row.into_organization(&self.shared)?;
            if org.datastore.same_database(location) {
                return Ok(Some(org.id));
            }
        }
        Ok(None)
    }
}
