use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::database::catalog::CollectionCatalog;
use crate::database::datastore::{Datastore, DatastoreProvider};
use crate::database::manager::{DatabaseError, DatabaseManager};
use crate::database::models::{CollectionProgress, MigrationOptions, MigrationRecord, MigrationStatus};
use crate::database::store::{MigrationStore, OrganizationDirectory, ProgressAck};
use crate::services::audit::{AuditEntry, AuditSink};
use crate::services::copier::CollectionCopier;
use crate::services::cutover::CutoverController;
use crate::services::error::MigrationError;
use crate::services::locks::TenantLocks;
use crate::types::{Actor, DatastoreKind, DatastoreLocation, MigrationDirection};

const DEFAULT_ABORT_REASON: &str = "Aborted by operator";
const UPDATE_RETRIES: usize = 3;
const MAX_DB_NAME_LEN: usize = 63;
const DB_NAME_HASH_LEN: usize = 12;

/// Parameters of a start request
#[derive(Debug, Clone)]
pub struct StartMigration {
    pub org_id: String,
    pub direction: MigrationDirection,
    pub target_uri: Option<String>,
    pub target_db_name: Option<String>,
    pub dry_run: bool,
    pub resume: bool,
    pub override_legal_hold: bool,
    pub chunk_size: Option<u32>,
}

impl StartMigration {
    pub fn new(org_id: impl Into<String>, direction: MigrationDirection) -> Self {
        Self {
            org_id: org_id.into(),
            direction,
            target_uri: None,
            target_db_name: None,
            dry_run: false,
            resume: false,
            override_legal_hold: false,
            chunk_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectionRun {
    Done,
    Halted,
}

/// Owns the migration state machine and the per-organization driver tasks
pub struct MigrationOrchestrator {
    store: Arc<dyn MigrationStore>,
    directory: Arc<dyn OrganizationDirectory>,
    datastores: Arc<dyn DatastoreProvider>,
    audit_sink: Arc<dyn AuditSink>,
    catalog: CollectionCatalog,
    config: MigrationConfig,
    shared: DatastoreLocation,
    locks: TenantLocks,
    /// Running driver per organization, tagged so a finished task only
    /// unregisters itself
    drivers: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
    driver_seq: AtomicU64,
}

impl MigrationOrchestrator {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        directory: Arc<dyn OrganizationDirectory>,
        datastores: Arc<dyn DatastoreProvider>,
        audit_sink: Arc<dyn AuditSink>,
        shared: DatastoreLocation,
        config: MigrationConfig,
    ) -> Result<Self, DatabaseError> {
        let catalog = CollectionCatalog::from_config(&config)?;
        Ok(Self {
            store,
            directory,
            datastores,
            audit_sink,
            catalog,
            config,
            shared,
            locks: TenantLocks::new(),
            drivers: Mutex::new(HashMap::new()),
            driver_seq: AtomicU64::new(0),
        })
    }

    pub fn with_catalog(mut self, catalog: CollectionCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Lock registry shared with the tenant write path
    pub fn tenant_locks(&self) -> &TenantLocks {
        &self.locks
    }

    pub fn catalog(&self) -> &CollectionCatalog {
        &self.catalog
    }

    /// Validate the request, create (or reuse) the record, move it to
    /// InProgress and hand the copy off to a background driver.
    pub async fn start(
        self: &Arc<Self>,
        request: StartMigration,
        actor: &Actor,
    ) -> Result<MigrationRecord, MigrationError> {
        let org_id = request.org_id.trim().to_string();
        if org_id.is_empty() {
            return Err(MigrationError::bad_request("orgId is required"));
        }
        let chunk_size = self.resolve_chunk_size(request.chunk_size)?;

        let org = self.directory.get(&org_id).await?;
        if org.archived_at.is_some() {
            return Err(MigrationError::bad_request("Archived organizations cannot be migrated"));
        }
        if org.legal_hold && !request.override_legal_hold {
            return Err(MigrationError::conflict(
                "Organization is under legal hold; set overrideLegalHold to migrate",
            ));
        }
        match (request.direction, org.datastore.kind) {
            (MigrationDirection::SharedToDedicated, DatastoreKind::Dedicated) => {
                return Err(MigrationError::bad_request(
                    "Organization is already on a dedicated datastore",
                ));
            }
            (MigrationDirection::DedicatedToShared, DatastoreKind::Shared) => {
                return Err(MigrationError::bad_request(
                    "Organization is not using a dedicated datastore",
                ));
            }
            _ => {}
        }

        if let Some(active) = self.store.find_active(&org_id).await? {
            if !request.resume {
                return Err(MigrationError::conflict(format!(
                    "Migration {} is already {} for this organization; set resume to continue it",
                    active.id,
                    active.status.as_str()
                )));
            }
            if active.direction != request.direction {
                return Err(MigrationError::conflict(format!(
                    "Migration {} runs {}, not {}",
                    active.id,
                    active.direction.as_str(),
                    request.direction.as_str()
                )));
            }
            return self.resume_active(active, actor).await;
        }

        let target = self.resolve_target(&request, &org_id)?;
        if target.same_database(&org.datastore) {
            return Err(MigrationError::bad_request(
                "Target datastore matches the source datastore",
            ));
        }
        if target.kind == DatastoreKind::Dedicated {
            if let Some(owner) = self.directory.dedicated_owner(&target, &org_id).await? {
                return Err(MigrationError::conflict(format!(
                    "Target database {} already belongs to organization {}",
                    target, owner
                )));
            }
        }

        let options = MigrationOptions {
            dry_run: request.dry_run,
            chunk_size,
            resume_requested: request.resume,
            allow_legal_hold_override: request.override_legal_hold,
            actor_id: actor.id.clone(),
        };
        let mut record =
            MigrationRecord::pending(&org_id, request.direction, org.datastore.clone(), target, options);

        if request.resume {
            if let Some(failed) = self.store.latest_failed(&org_id, request.direction).await? {
                if failed.target.same_database(&record.target) && failed.dry_run == record.dry_run {
                    info!("Resuming failed migration {} for org {}", failed.id, org_id);
                    record = record.resuming(&failed);
                } else {
                    warn!(
                        "Failed migration {} for org {} used a different target; starting fresh",
                        failed.id, org_id
                    );
                }
            }
        }

        let record = self.store.create(&record).await?;
        self.audit(
            "migration.start",
            &org_id,
            actor,
            json!({
                "migrationId": record.id,
                "direction": record.direction.as_str(),
                "target": record.target.to_string(),
                "dryRun": record.dry_run,
                "chunkSize": record.chunk_size,
                "resumedFrom": record.resumed_from,
                "legalHoldOverride": org.legal_hold && request.override_legal_hold,
            }),
        )
        .await;

        self.begin(record).await
    }

    pub async fn get_status(&self, org_id: &str) -> Result<MigrationRecord, MigrationError> {
        let org_id = org_id.trim();
        if org_id.is_empty() {
            return Err(MigrationError::bad_request("orgId is required"));
        }
        self.store.get(org_id).await.map_err(|e| match e {
            DatabaseError::NotFound(_) => {
                MigrationError::not_found("No migration found for this organization")
            }
            other => other.into(),
        })
    }

    pub async fn abort(
        &self,
        migration_id: Uuid,
        org_id: &str,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<MigrationRecord, MigrationError> {
        let record = self.load_for_org(migration_id, org_id).await?;
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_ABORT_REASON.to_string());

        let (record, applied) = self
            .update_with_retry(record.id, |r| match r.status {
                MigrationStatus::Aborted => Ok(false),
                MigrationStatus::Completed | MigrationStatus::Failed => {
                    Err(MigrationError::conflict(format!(
                        "Cannot abort a migration that is {}",
                        r.status.as_str()
                    )))
                }
                _ => {
                    r.transition(MigrationStatus::Aborted)?;
                    r.error_message = Some(reason.clone());
                    Ok(true)
                }
            })
            .await?;

        if applied {
            info!("Migration {} for org {} aborted: {}", record.id, record.org_id, reason);
            let removed = self.discard_target_rows(&record).await;
            self.audit(
                "migration.aborted",
                &record.org_id,
                actor,
                json!({ "migrationId": record.id, "reason": reason, "targetRowsRemoved": removed }),
            )
            .await;
        }
        Ok(record)
    }

    pub async fn finalize(
        &self,
        migration_id: Uuid,
        org_id: &str,
        confirm_cutover: bool,
        actor: &Actor,
    ) -> Result<MigrationRecord, MigrationError> {
        let record = self.load_for_org(migration_id, org_id).await?;
        if !confirm_cutover {
            return Err(MigrationError::bad_request("confirmCutover must be true to finalize"));
        }
        if record.dry_run {
            return Err(MigrationError::bad_request("Dry-run migrations cannot be finalized"));
        }
        if record.status != MigrationStatus::ReadyForCutover {
            return Err(MigrationError::conflict(format!(
                "Migration is {}, not ready_for_cutover",
                record.status.as_str()
            )));
        }

        let source = self.open(&record.source).await?;
        let target = self.open(&record.target).await?;
        let controller = CutoverController::new(
            self.store.clone(),
            self.directory.clone(),
            source,
            target,
            self.catalog.clone(),
            self.locks.clone(),
        );

        match controller.run(record.clone()).await {
            Ok(completed) => {
                self.audit(
                    "migration.finalized",
                    &completed.org_id,
                    actor,
                    json!({
                        "migrationId": completed.id,
                        "target": completed.target.to_string(),
                        "copied": completed.total_copied(),
                    }),
                )
                .await;
                Ok(completed)
            }
            Err(err) => {
                let failed = matches!(
                    self.store.get_by_id(record.id).await,
                    Ok(ref r) if r.status == MigrationStatus::Failed
                );
                let action = if failed {
                    "migration.failed"
                } else {
                    "migration.cutover_failed"
                };
                self.audit(
                    action,
                    &record.org_id,
                    actor,
                    json!({ "migrationId": record.id, "error": err.to_string() }),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Wait for the in-process driver of an organization, if any
    pub async fn join_driver(&self, org_id: &str) {
        let handle = self.drivers.lock().await.remove(org_id);
        if let Some((_, handle)) = handle {
            if let Err(e) = handle.await {
                error!("Migration driver for org {} panicked: {}", org_id, e);
            }
        }
    }

    /// Stop every in-process driver. Records stay InProgress with their
    /// checkpoints and continue from there on a `resume` start.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = self
            .drivers
            .lock()
            .await
            .drain()
            .map(|(org_id, (_, handle))| (org_id, handle))
            .collect();
        for (org_id, handle) in handles {
            handle.abort();
            match handle.await {
                Err(e) if e.is_panic() => error!("Migration driver for org {} panicked: {}", org_id, e),
                _ => info!("Migration driver for org {} stopped", org_id),
            }
        }
    }

    fn resolve_chunk_size(&self, requested: Option<u32>) -> Result<u32, MigrationError> {
        let chunk_size = requested.unwrap_or(self.config.default_chunk_size);
        if chunk_size == 0 || chunk_size > self.config.max_chunk_size {
            return Err(MigrationError::bad_request(format!(
                "chunkSize must be between 1 and {}",
                self.config.max_chunk_size
            )));
        }
        Ok(chunk_size)
    }

    fn resolve_target(
        &self,
        request: &StartMigration,
        org_id: &str,
    ) -> Result<DatastoreLocation, MigrationError> {
        let kind = request.direction.target_kind();
        let uri = request
            .target_uri
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.shared.uri.clone());
        let db_name = match (kind, request.target_db_name.clone().filter(|d| !d.is_empty())) {
            (_, Some(name)) => Some(name),
            (DatastoreKind::Dedicated, None) => {
                let prefix = &self.config.dedicated_db_prefix;
                let room = MAX_DB_NAME_LEN.saturating_sub(prefix.len());
                Some(format!("{}{}", prefix, dedicated_db_suffix(org_id, room)))
            }
            (DatastoreKind::Shared, None) => self.shared.db_name.clone(),
        };

        if let Some(name) = &db_name {
            if !DatabaseManager::is_valid_db_name(name) {
                return Err(MigrationError::bad_request(format!(
                    "Invalid target database name '{}'",
                    name
                )));
            }
        }

        let location = DatastoreLocation::new(kind, uri, db_name);
        location
            .connection_url()
            .map_err(|e| MigrationError::bad_request(format!("Invalid targetUri: {}", e)))?;
        Ok(location)
    }

    async fn resume_active(
        self: &Arc<Self>,
        active: MigrationRecord,
        actor: &Actor,
    ) -> Result<MigrationRecord, MigrationError> {
        match active.status {
            MigrationStatus::ReadyForCutover => Ok(active),
            MigrationStatus::Pending => self.begin(active).await,
            _ => {
                if self.driver_running(&active.org_id).await {
                    debug!("Migration {} already has a running driver", active.id);
                    return Ok(active);
                }
                let actor_id = actor.id.clone();
                let (record, _) = self
                    .update_with_retry(active.id, |r| {
                        if r.status != MigrationStatus::InProgress {
                            return Err(MigrationError::conflict(format!(
                                "Migration is {}, cannot resume",
                                r.status.as_str()
                            )));
                        }
                        r.resume_requested = true;
                        if actor_id.is_some() {
                            r.actor_id = actor_id.clone();
                        }
                        Ok(true)
                    })
                    .await?;
                info!("Resuming migration {} for org {}", record.id, record.org_id);
                self.spawn_driver(&record).await;
                Ok(record)
            }
        }
    }

    async fn begin(self: &Arc<Self>, mut record: MigrationRecord) -> Result<MigrationRecord, MigrationError> {
        record.transition(MigrationStatus::InProgress)?;
        let record = self.store.update(&record).await?;
        info!(
            "Migration {} for org {} in progress ({}, chunk size {}{})",
            record.id,
            record.org_id,
            record.direction.as_str(),
            record.chunk_size,
            if record.dry_run { ", dry run" } else { "" }
        );
        self.spawn_driver(&record).await;
        Ok(record)
    }

    async fn driver_running(&self, org_id: &str) -> bool {
        self.drivers
            .lock()
            .await
            .get(org_id)
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false)
    }

    async fn spawn_driver(self: &Arc<Self>, record: &MigrationRecord) {
        let mut drivers = self.drivers.lock().await;
        if let Some((_, handle)) = drivers.get(&record.org_id) {
            if !handle.is_finished() {
                return;
            }
        }
        let this = Arc::clone(self);
        let id = record.id;
        let org_id = record.org_id.clone();
        let seq = self.driver_seq.fetch_add(1, Ordering::SeqCst);
        // The task blocks on the registry lock held here until it is registered
        let handle = tokio::spawn(async move {
            this.drive(id).await;
            this.unregister_driver(&org_id, seq).await;
        });
        drivers.insert(record.org_id.clone(), (seq, handle));
    }

    async fn unregister_driver(&self, org_id: &str, seq: u64) {
        let mut drivers = self.drivers.lock().await;
        if matches!(drivers.get(org_id), Some((current, _)) if *current == seq) {
            drivers.remove(org_id);
        }
    }

    async fn drive(&self, id: Uuid) {
        if let Err(err) = self.run_driver(id).await {
            error!("Migration {} failed: {}", id, err);
            self.fail_migration(id, &err).await;
        }
    }

    async fn run_driver(&self, id: Uuid) -> Result<(), MigrationError> {
        let record = self.store.get_by_id(id).await?;
        if record.status != MigrationStatus::InProgress {
            return Ok(());
        }

        if record.target.kind == DatastoreKind::Dedicated {
            let created = self.datastores.provision(&record.target).await.map_err(|e| {
                MigrationError::fatal(format!("Cannot provision target datastore {}: {}", record.target, e))
            })?;
            if created {
                info!("Provisioned target datastore {} for migration {}", record.target, id);
            }
        }

        let source = self.open(&record.source).await?;
        let target = self.open(&record.target).await?;
        target.ping().await.map_err(|e| {
            MigrationError::fatal(format!("Target datastore {} is unreachable: {}", record.target, e))
        })?;

        let copier = CollectionCopier::new(
            source,
            target,
            self.catalog.clone(),
            self.config.clone(),
        );

        // Initialise (or refresh) the checkpoint of every collection
        let mut plans = Vec::with_capacity(self.catalog.len());
        for spec in self.catalog.iter() {
            let mut progress = record
                .collections_progress
                .get(&spec.name)
                .cloned()
                .unwrap_or_default();
            if !progress.done {
                progress.total = copier.source_count(&spec.name, &record.org_id).await?;
            }
            match self.checkpoint(id, &spec.name, &progress).await? {
                Some(stored) => plans.push((spec.name.clone(), stored)),
                None => return Ok(()),
            }
        }

        // A collection copied from the start must not keep rows an earlier
        // attempt left behind, or verification would count them
        if !record.dry_run {
            for (name, progress) in &plans {
                if progress.copied == 0 && progress.last_id.is_none() && !progress.done {
                    let removed = copier.clear_target(name, &record.org_id).await?;
                    if removed > 0 {
                        info!(
                            "Migration {}: removed {} stale {} rows from {}",
                            id, removed, name, record.target
                        );
                    }
                }
            }
        }

        let halt = AtomicBool::new(false);
        let runs: Vec<_> = plans
            .into_iter()
            .map(|(name, progress)| self.drive_collection(&record, &copier, name, progress, &halt))
            .collect();
        let results: Vec<Result<CollectionRun, MigrationError>> = stream::iter(runs)
            .buffer_unordered(self.config.max_parallel_collections.max(1))
            .collect()
            .await;

        let mut halted = false;
        for result in results {
            match result? {
                CollectionRun::Done => {}
                CollectionRun::Halted => halted = true,
            }
        }
        if halted {
            // A chunk in flight when the abort landed may have been written
            // after the abort's own cleanup
            let current = self.store.get_by_id(id).await?;
            if current.status == MigrationStatus::Aborted {
                self.discard_target_rows(&current).await;
            }
            return Ok(());
        }

        self.complete_copy(id).await
    }

    /// Store a checkpoint. Returns the progress to continue from, or None once
    /// the migration has left InProgress.
    async fn checkpoint(
        &self,
        id: Uuid,
        collection: &str,
        progress: &CollectionProgress,
    ) -> Result<Option<CollectionProgress>, MigrationError> {
        match self.store.record_progress(id, collection, progress).await {
            Ok(ProgressAck::Applied) => Ok(Some(progress.clone())),
            Ok(ProgressAck::Superseded(stored)) => {
                debug!("Checkpoint for {} superseded by a concurrent writer", collection);
                Ok(Some(stored))
            }
            Err(DatabaseError::Conflict(message)) => {
                debug!("Stopping {} for migration {}: {}", collection, id, message);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn drive_collection(
        &self,
        record: &MigrationRecord,
        copier: &CollectionCopier,
        name: String,
        mut progress: CollectionProgress,
        halt: &AtomicBool,
    ) -> Result<CollectionRun, MigrationError> {
        let mut consecutive_failures = 0u32;
        let tolerated = self.config.max_consecutive_chunk_failures.max(1);

        while !progress.done {
            if halt.load(Ordering::SeqCst) {
                return Ok(CollectionRun::Halted);
            }
            let current = match self.store.get_by_id(record.id).await {
                Ok(current) => current,
                Err(e) => {
                    halt.store(true, Ordering::SeqCst);
                    return Err(e.into());
                }
            };
            if current.status != MigrationStatus::InProgress {
                debug!(
                    "Migration {} is {}; stopping {}",
                    record.id,
                    current.status.as_str(),
                    name
                );
                return Ok(CollectionRun::Halted);
            }

            let chunk = copier
                .copy_chunk(
                    &record.org_id,
                    &name,
                    progress.last_id.as_deref(),
                    record.chunk_size,
                    record.dry_run,
                )
                .await;

            match chunk {
                Ok(chunk) => {
                    consecutive_failures = 0;
                    let next = CollectionProgress {
                        total: progress.total.max(progress.copied + chunk.copied_count),
                        copied: progress.copied + chunk.copied_count,
                        last_id: chunk.new_cursor,
                        done: chunk.done,
                    };
                    match self.checkpoint(record.id, &name, &next).await {
                        Ok(Some(stored)) => progress = stored,
                        Ok(None) => return Ok(CollectionRun::Halted),
                        Err(e) => {
                            halt.store(true, Ordering::SeqCst);
                            return Err(e);
                        }
                    }
                }
                Err(err @ MigrationError::ChunkCopyFailed { .. }) => {
                    consecutive_failures += 1;
                    warn!(
                        "Migration {}: {} ({}/{} tolerated)",
                        record.id, err, consecutive_failures, tolerated
                    );
                    if consecutive_failures >= tolerated {
                        halt.store(true, Ordering::SeqCst);
                        return Err(err);
                    }
                }
                Err(err) => {
                    halt.store(true, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }

        info!(
            "Migration {}: {} copied {}/{} rows",
            record.id, name, progress.copied, progress.total
        );
        self.audit_entry(AuditEntry::new(
            "migration.progress",
            &record.org_id,
            record.actor_id.clone(),
            json!({
                "migrationId": record.id,
                "collection": name,
                "copied": progress.copied,
                "total": progress.total,
            }),
        ))
        .await;
        Ok(CollectionRun::Done)
    }

    async fn complete_copy(&self, id: Uuid) -> Result<(), MigrationError> {
        let result = self
            .update_with_retry(id, |r| {
                if r.status != MigrationStatus::InProgress {
                    return Ok(false);
                }
                if !r.all_collections_done() && !self.catalog.is_empty() {
                    return Err(MigrationError::fatal("Copy finished with incomplete collections"));
                }
                let next = if r.dry_run {
                    MigrationStatus::Completed
                } else {
                    MigrationStatus::ReadyForCutover
                };
                r.transition(next)?;
                r.last_progress_at = Some(Utc::now());
                Ok(true)
            })
            .await?;

        let (record, applied) = result;
        if !applied {
            return Ok(());
        }

        let action = if record.dry_run {
            "migration.dry_run.completed"
        } else {
            "migration.ready_for_cutover"
        };
        info!(
            "Migration {} for org {} is {} ({} rows)",
            record.id,
            record.org_id,
            record.status.as_str(),
            record.total_copied()
        );
        self.audit_entry(AuditEntry::new(
            action,
            &record.org_id,
            record.actor_id.clone(),
            json!({ "migrationId": record.id, "copied": record.total_copied() }),
        ))
        .await;
        Ok(())
    }

    async fn fail_migration(&self, id: Uuid, err: &MigrationError) {
        let message = err.to_string();
        let result = self
            .update_with_retry(id, |r| {
                if r.status.is_terminal() {
                    return Ok(false);
                }
                r.transition(MigrationStatus::Failed)?;
                r.error_message = Some(message.clone());
                Ok(true)
            })
            .await;

        match result {
            Ok((record, true)) => {
                self.audit_entry(AuditEntry::new(
                    "migration.failed",
                    &record.org_id,
                    record.actor_id.clone(),
                    json!({ "migrationId": record.id, "error": message }),
                ))
                .await;
            }
            Ok((_, false)) => {}
            Err(e) => error!("Failed to mark migration {} as failed: {}", id, e),
        }
    }

    /// Read-modify-write with optimistic concurrency. `mutate` returns false
    /// when the stored record needs no change.
    async fn update_with_retry<F>(
        &self,
        id: Uuid,
        mut mutate: F,
    ) -> Result<(MigrationRecord, bool), MigrationError>
    where
        F: FnMut(&mut MigrationRecord) -> Result<bool, MigrationError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut record = self.store.get_by_id(id).await?;
            if !mutate(&mut record)? {
                return Ok((record, false));
            }
            match self.store.update(&record).await {
                Ok(updated) => return Ok((updated, true)),
                Err(DatabaseError::Conflict(message)) if attempt < UPDATE_RETRIES => {
                    debug!("Retrying update of migration {} after conflict: {}", id, message);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn load_for_org(&self, migration_id: Uuid, org_id: &str) -> Result<MigrationRecord, MigrationError> {
        let not_found = || MigrationError::not_found("Migration not found");
        let record = self.store.get_by_id(migration_id).await.map_err(|e| match e {
            DatabaseError::NotFound(_) => not_found(),
            other => other.into(),
        })?;
        if record.org_id != org_id.trim() {
            return Err(not_found());
        }
        Ok(record)
    }

    /// Best effort: remove what an aborted copy wrote to the target. The
    /// source stays authoritative, so failures are only logged.
    async fn discard_target_rows(&self, record: &MigrationRecord) -> u64 {
        if record.dry_run {
            return 0;
        }
        let target = match self.open(&record.target).await {
            Ok(target) => target,
            Err(e) => {
                warn!("Cleanup of aborted migration {} skipped: {}", record.id, e);
                return 0;
            }
        };
        let mut removed = 0;
        for spec in self.catalog.iter() {
            match target.delete_org(spec, &record.org_id).await {
                Ok(n) => removed += n,
                Err(e) => warn!(
                    "Cleanup of {} for aborted migration {} failed: {}",
                    spec.name, record.id, e
                ),
            }
        }
        if removed > 0 {
            info!(
                "Removed {} rows of aborted migration {} from {}",
                removed, record.id, record.target
            );
        }
        removed
    }

    async fn open(&self, location: &DatastoreLocation) -> Result<Arc<dyn Datastore>, MigrationError> {
        self.datastores.open(location).await.map_err(|e| {
            MigrationError::fatal(format!("Cannot open datastore {}: {}", location, e))
        })
    }

    async fn audit(&self, action: &str, org_id: &str, actor: &Actor, detail: Value) {
        self.audit_entry(AuditEntry::new(action, org_id, actor.id.clone(), detail))
            .await;
    }

    async fn audit_entry(&self, entry: AuditEntry) {
        let action = entry.action.clone();
        if let Err(e) = self.audit_sink.record(entry).await {
            warn!("Audit write for {} failed: {}", action, e);
        }
    }
}

/// Database-name suffix for an organization's default dedicated database.
///
/// Ids that are already lowercase `[a-z0-9_]` and fit are used as they are.
/// Anything else is sanitized and tagged with a hash of the raw id, so two
/// ids that sanitize alike still get different databases.
fn dedicated_db_suffix(org_id: &str, max_len: usize) -> String {
    let plain: String = org_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if plain == org_id && plain.len() <= max_len {
        return plain;
    }

    let hash = format!("{:x}", Sha256::digest(org_id.as_bytes()));
    let tag = &hash[..DB_NAME_HASH_LEN];
    let keep = max_len.saturating_sub(tag.len() + 1);
    let head: String = plain.chars().take(keep).collect();
    format!("{}_{}", head, tag)
}
