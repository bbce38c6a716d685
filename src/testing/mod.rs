//! In-memory collaborators for unit tests.
//!
//! `MemoryBackend` mirrors the guards of the Postgres store (version checks,
//! one active record per organization, monotonic checkpoints) so the
//! orchestrator can be exercised without a database.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::database::catalog::{CollectionCatalog, CollectionSpec};
use crate::database::datastore::{Datastore, DatastoreProvider, SourceRow};
use crate::database::manager::DatabaseError;
use crate::database::models::{
    CollectionProgress, MigrationOptions, MigrationRecord, MigrationStatus, Organization,
};
use crate::database::store::{MigrationStore, OrganizationDirectory, ProgressAck};
use crate::services::audit::{AuditEntry, AuditSink};
use crate::services::orchestrator::MigrationOrchestrator;
use crate::types::{DatastoreKind, DatastoreLocation, MigrationDirection};

pub fn shared_location() -> DatastoreLocation {
    DatastoreLocation::new(
        DatastoreKind::Shared,
        "postgres://localhost:5432/postgres",
        Some("shared_main".to_string()),
    )
}

pub fn dedicated_location(org_id: &str) -> DatastoreLocation {
    DatastoreLocation::new(
        DatastoreKind::Dedicated,
        "postgres://localhost:5432/postgres",
        Some(format!("tenant_{}", org_id)),
    )
}

pub fn persons_catalog() -> CollectionCatalog {
    CollectionCatalog::new(vec![CollectionSpec::new("persons", "persons", "org_id").unwrap()])
}

pub fn fast_migration_config() -> MigrationConfig {
    MigrationConfig {
        chunk_retry_attempts: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 2,
        chunk_write_timeout_ms: 1_000,
        ..MigrationConfig::default()
    }
}

// ---------------------------------------------------------------------------
// System store + organization directory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BackendState {
    migrations: Vec<MigrationRecord>,
    orgs: HashMap<String, Organization>,
    fail_freeze: bool,
    fail_commit: bool,
    freeze_calls: usize,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_org(&self, org_id: &str) {
        let org = Organization {
            id: org_id.to_string(),
            name: format!("Org {}", org_id),
            legal_hold: false,
            archived_at: None,
            datastore: shared_location(),
            write_frozen: false,
            last_migrated_at: None,
        };
        self.state.lock().unwrap().orgs.insert(org_id.to_string(), org);
    }

    pub fn set_legal_hold(&self, org_id: &str, hold: bool) {
        if let Some(org) = self.state.lock().unwrap().orgs.get_mut(org_id) {
            org.legal_hold = hold;
        }
    }

    pub fn archive(&self, org_id: &str) {
        if let Some(org) = self.state.lock().unwrap().orgs.get_mut(org_id) {
            org.archived_at = Some(Utc::now());
        }
    }

    /// Point the organization at another datastore
    pub fn move_org(&self, org_id: &str, location: DatastoreLocation) {
        if let Some(org) = self.state.lock().unwrap().orgs.get_mut(org_id) {
            org.datastore = location;
        }
    }

    pub fn organization(&self, org_id: &str) -> Organization {
        self.state.lock().unwrap().orgs[org_id].clone()
    }

    pub fn insert_record(&self, record: MigrationRecord) {
        self.state.lock().unwrap().migrations.push(record);
    }

    pub fn record(&self, id: Uuid) -> MigrationRecord {
        self.state
            .lock()
            .unwrap()
            .migrations
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .unwrap()
    }

    pub fn freeze_calls(&self) -> usize {
        self.state.lock().unwrap().freeze_calls
    }

    pub fn fail_freeze(&self, fail: bool) {
        self.state.lock().unwrap().fail_freeze = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        self.state.lock().unwrap().fail_commit = fail;
    }
}

fn latest<'a>(records: impl Iterator<Item = &'a MigrationRecord>) -> Option<MigrationRecord> {
    // max_by_key keeps the last maximum, i.e. the most recently inserted on ties
    records.max_by_key(|r| r.started_at).cloned()
}

#[async_trait]
impl MigrationStore for MemoryBackend {
    async fn create(&self, record: &MigrationRecord) -> Result<MigrationRecord, DatabaseError> {
        let mut state = self.state.lock().unwrap();
        if state
            .migrations
            .iter()
            .any(|r| r.org_id == record.org_id && !r.status.is_terminal())
        {
            return Err(DatabaseError::Conflict(format!(
                "an active migration already exists for org {}",
                record.org_id
            )));
        }
        let mut stored = record.clone();
        stored.version = 0;
        state.migrations.push(stored.clone());
        Ok(stored)
    }

    async fn get(&self, org_id: &str) -> Result<MigrationRecord, DatabaseError> {
        let state = self.state.lock().unwrap();
        latest(state.migrations.iter().filter(|r| r.org_id == org_id))
            .ok_or_else(|| DatabaseError::NotFound(format!("no migration for org {}", org_id)))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<MigrationRecord, DatabaseError> {
        let state = self.state.lock().unwrap();
        state
            .migrations
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound(format!("migration {}", id)))
    }

    async fn find_active(&self, org_id: &str) -> Result<Option<MigrationRecord>, DatabaseError> {
        let state = self.state.lock().unwrap();
        Ok(latest(
            state
                .migrations
                .iter()
                .filter(|r| r.org_id == org_id && !r.status.is_terminal()),
        ))
    }

    async fn latest_failed(
        &self,
        org_id: &str,
        direction: MigrationDirection,
    ) -> Result<Option<MigrationRecord>, DatabaseError> {
        // Only when the organization's latest record is the failed one
        let state = self.state.lock().unwrap();
        Ok(latest(state.migrations.iter().filter(|r| r.org_id == org_id))
            .filter(|r| r.status == MigrationStatus::Failed && r.direction == direction))
    }

    async fn update(&self, record: &MigrationRecord) -> Result<MigrationRecord, DatabaseError> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .migrations
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| DatabaseError::NotFound(format!("migration {}", record.id)))?;
        let legal = stored.status == record.status || stored.status.can_transition_to(record.status);
        if stored.version != record.version || stored.status.is_terminal() || !legal {
            return Err(DatabaseError::Conflict(format!(
                "migration {} was modified concurrently",
                record.id
            )));
        }
        *stored = record.clone();
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn record_progress(
        &self,
        id: Uuid,
        collection: &str,
        progress: &CollectionProgress,
    ) -> Result<ProgressAck, DatabaseError> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .migrations
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DatabaseError::NotFound(format!("migration {}", id)))?;
        if stored.status != MigrationStatus::InProgress {
            return Err(DatabaseError::Conflict(format!(
                "migration {} is {}",
                id,
                stored.status.as_str()
            )));
        }
        if let Some(existing) = stored.collections_progress.get(collection) {
            if existing.copied > progress.copied {
                return Ok(ProgressAck::Superseded(existing.clone()));
            }
        }
        stored
            .collections_progress
            .insert(collection.to_string(), progress.clone());
        stored.last_progress_at = Some(Utc::now());
        stored.version += 1;
        Ok(ProgressAck::Applied)
    }

    async fn commit_cutover(
        &self,
        record: &MigrationRecord,
        pointer: &DatastoreLocation,
    ) -> Result<MigrationRecord, DatabaseError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commit {
            return Err(DatabaseError::QueryError("injected commit failure".into()));
        }
        let now = Utc::now();
        let completed = {
            let stored = state
                .migrations
                .iter_mut()
                .find(|r| r.id == record.id)
                .ok_or_else(|| DatabaseError::NotFound(format!("migration {}", record.id)))?;
            if stored.version != record.version || stored.status != MigrationStatus::ReadyForCutover {
                return Err(DatabaseError::Conflict(format!(
                    "migration {} was modified concurrently",
                    record.id
                )));
            }
            stored.status = MigrationStatus::Completed;
            stored.completed_at = Some(now);
            stored.last_progress_at = Some(now);
            stored.version += 1;
            stored.clone()
        };
        let org = state
            .orgs
            .get_mut(&record.org_id)
            .ok_or_else(|| DatabaseError::NotFound(format!("organization {}", record.org_id)))?;
        org.datastore = pointer.clone();
        org.write_frozen = false;
        org.last_migrated_at = Some(now);
        Ok(completed)
    }
}

#[async_trait]
impl OrganizationDirectory for MemoryBackend {
    async fn get(&self, org_id: &str) -> Result<Organization, DatabaseError> {
        self.state
            .lock()
            .unwrap()
            .orgs
            .get(org_id)
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound("Organization not found".to_string()))
    }

    async fn set_write_frozen(&self, org_id: &str, frozen: bool) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().unwrap();
        if frozen {
            state.freeze_calls += 1;
            if state.fail_freeze {
                return Err(DatabaseError::QueryError("injected freeze failure".into()));
            }
        }
        let org = state
            .orgs
            .get_mut(org_id)
            .ok_or_else(|| DatabaseError::NotFound("Organization not found".to_string()))?;
        org.write_frozen = frozen;
        Ok(())
    }

    async fn dedicated_owner(
        &self,
        location: &DatastoreLocation,
        org_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .orgs
            .values()
            .find(|org| {
                org.id != org_id
                    && org.datastore.kind == DatastoreKind::Dedicated
                    && org.datastore.same_database(location)
            })
            .map(|org| org.id.clone()))
    }
}

// ---------------------------------------------------------------------------
// Datastores
// ---------------------------------------------------------------------------

struct StoredRow {
    org_id: String,
    row: SourceRow,
}

struct DatastoreState {
    collections: BTreeMap<String, BTreeMap<String, StoredRow>>,
    writes: usize,
    failing_writes: u32,
    write_budget: Option<u32>,
    reachable: bool,
    fetches: Vec<(String, Option<String>)>,
    fetch_gates: HashMap<String, Arc<Semaphore>>,
    fetch_delay: Option<Duration>,
    fetches_in_flight: usize,
    max_fetches_in_flight: usize,
}

pub struct MemoryDatastore {
    location: DatastoreLocation,
    state: Mutex<DatastoreState>,
}

impl MemoryDatastore {
    pub fn new(location: DatastoreLocation) -> Self {
        Self {
            location,
            state: Mutex::new(DatastoreState {
                collections: BTreeMap::new(),
                writes: 0,
                failing_writes: 0,
                write_budget: None,
                reachable: true,
                fetches: Vec::new(),
                fetch_gates: HashMap::new(),
                fetch_delay: None,
                fetches_in_flight: 0,
                max_fetches_in_flight: 0,
            }),
        }
    }

    pub fn seed(&self, collection: &str, org_id: &str, ids: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let rows = state.collections.entry(collection.to_string()).or_default();
        for id in ids {
            rows.insert(
                id.to_string(),
                StoredRow {
                    org_id: org_id.to_string(),
                    row: SourceRow {
                        id: id.to_string(),
                        body: json!({ "id": id, "org_id": org_id }),
                    },
                },
            );
        }
    }

    pub fn remove(&self, collection: &str, org_id: &str, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(rows) = state.collections.get_mut(collection) {
            if rows.get(id).map(|r| r.org_id == org_id).unwrap_or(false) {
                rows.remove(id);
            }
        }
    }

    pub fn ids(&self, collection: &str, org_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .collections
            .get(collection)
            .map(|rows| {
                rows.values()
                    .filter(|r| r.org_id == org_id)
                    .map(|r| r.row.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Successful upsert calls
    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// The next `n` write attempts fail
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().unwrap().failing_writes = n;
    }

    /// Allow `n` more successful writes, then fail every write. `u32::MAX` lifts the limit.
    pub fn fail_writes_after(&self, n: u32) {
        self.state.lock().unwrap().write_budget = if n == u32::MAX { None } else { Some(n) };
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    /// Fetches of `collection` wait for a permit of the returned semaphore
    pub fn gate_fetches(&self, collection: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state
            .lock()
            .unwrap()
            .fetch_gates
            .insert(collection.to_string(), gate.clone());
        gate
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().unwrap().fetch_delay = Some(delay);
    }

    /// Highest number of fetches that were running at the same time
    pub fn max_fetches_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_fetches_in_flight
    }

    pub fn fetches_from(&self, collection: &str, cursor: Option<&str>) -> usize {
        self.state
            .lock()
            .unwrap()
            .fetches
            .iter()
            .filter(|(c, after)| c == collection && after.as_deref() == cursor)
            .count()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    fn location(&self) -> &DatastoreLocation {
        &self.location
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        if self.state.lock().unwrap().reachable {
            Ok(())
        } else {
            Err(DatabaseError::QueryError("connection refused".into()))
        }
    }

    async fn count(&self, collection: &CollectionSpec, org_id: &str) -> Result<u64, DatabaseError> {
        Ok(self.ids(&collection.name, org_id).len() as u64)
    }

    async fn fetch_after(
        &self,
        collection: &CollectionSpec,
        org_id: &str,
        after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<SourceRow>, DatabaseError> {
        let gate = self.state.lock().unwrap().fetch_gates.get(&collection.name).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let delay = {
            let mut state = self.state.lock().unwrap();
            state.fetches_in_flight += 1;
            state.max_fetches_in_flight = state.max_fetches_in_flight.max(state.fetches_in_flight);
            state.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.fetches_in_flight -= 1;
        state
            .fetches
            .push((collection.name.clone(), after.map(str::to_string)));
        let rows = match state.collections.get(&collection.name) {
            Some(rows) => rows
                .values()
                .filter(|r| r.org_id == org_id)
                .filter(|r| after.map(|a| r.row.id.as_str() > a).unwrap_or(true))
                .take(limit as usize)
                .map(|r| r.row.clone())
                .collect(),
            None => Vec::new(),
        };
        Ok(rows)
    }

    async fn upsert(&self, collection: &CollectionSpec, rows: &[SourceRow]) -> Result<u64, DatabaseError> {
        let mut state = self.state.lock().unwrap();
        if !state.reachable {
            return Err(DatabaseError::QueryError("connection refused".into()));
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(DatabaseError::QueryError("injected write failure".into()));
        }
        if let Some(budget) = state.write_budget {
            if budget == 0 {
                return Err(DatabaseError::QueryError("injected write failure".into()));
            }
            state.write_budget = Some(budget - 1);
        }
        let target = state.collections.entry(collection.name.clone()).or_default();
        for row in rows {
            let org_id = row
                .body
                .get(&collection.org_column)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            target.insert(
                row.id.clone(),
                StoredRow {
                    org_id,
                    row: row.clone(),
                },
            );
        }
        state.writes += 1;
        Ok(rows.len() as u64)
    }

    async fn delete_org(&self, collection: &CollectionSpec, org_id: &str) -> Result<u64, DatabaseError> {
        let mut state = self.state.lock().unwrap();
        if !state.reachable {
            return Err(DatabaseError::QueryError("connection refused".into()));
        }
        let Some(rows) = state.collections.get_mut(&collection.name) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|_, r| r.org_id != org_id);
        Ok((before - rows.len()) as u64)
    }
}

/// Routes shared locations to one store and dedicated locations to another
pub struct MemoryDatastoreProvider {
    pub shared: Arc<MemoryDatastore>,
    pub dedicated: Arc<MemoryDatastore>,
    provisioned: Mutex<Vec<DatastoreLocation>>,
    fail_provision: AtomicBool,
}

impl MemoryDatastoreProvider {
    pub fn new(shared: Arc<MemoryDatastore>, dedicated: Arc<MemoryDatastore>) -> Self {
        Self {
            shared,
            dedicated,
            provisioned: Mutex::new(Vec::new()),
            fail_provision: AtomicBool::new(false),
        }
    }

    /// Databases created through `provision`, in order
    pub fn provisioned(&self) -> Vec<DatastoreLocation> {
        self.provisioned.lock().unwrap().clone()
    }

    pub fn set_fail_provision(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatastoreProvider for MemoryDatastoreProvider {
    async fn open(&self, location: &DatastoreLocation) -> Result<Arc<dyn Datastore>, DatabaseError> {
        let store: Arc<dyn Datastore> = match location.kind {
            DatastoreKind::Shared => self.shared.clone(),
            DatastoreKind::Dedicated => self.dedicated.clone(),
        };
        Ok(store)
    }

    async fn provision(&self, location: &DatastoreLocation) -> Result<bool, DatabaseError> {
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(DatabaseError::ConfigMissing("DATABASE_TENANT_TEMPLATE"));
        }
        let mut provisioned = self.provisioned.lock().unwrap();
        if provisioned.iter().any(|p| p.same_database(location)) {
            return Ok(false);
        }
        provisioned.push(location.clone());
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
    failing: AtomicBool,
}

impl RecordingAuditSink {
    pub fn actions(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.action.clone())
            .collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), DatabaseError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DatabaseError::QueryError("audit log unavailable".into()));
        }
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// An orchestrator wired to in-memory collaborators
///
/// `source` backs every shared location and `target` every dedicated one,
/// whatever the direction of the migration under test.
pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub source: Arc<MemoryDatastore>,
    pub target: Arc<MemoryDatastore>,
    pub datastores: Arc<MemoryDatastoreProvider>,
    pub audit: Arc<RecordingAuditSink>,
    pub orchestrator: Arc<MigrationOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(&["persons", "projects"], fast_migration_config())
    }

    pub fn with(collections: &[&str], config: MigrationConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let source = Arc::new(MemoryDatastore::new(shared_location()));
        let target = Arc::new(MemoryDatastore::new(dedicated_location("any")));
        let audit = Arc::new(RecordingAuditSink::default());
        let datastores = Arc::new(MemoryDatastoreProvider::new(source.clone(), target.clone()));
        let catalog = CollectionCatalog::new(
            collections
                .iter()
                .map(|name| CollectionSpec::new(name, name, "org_id").unwrap())
                .collect(),
        );
        let orchestrator = MigrationOrchestrator::new(
            backend.clone(),
            backend.clone(),
            datastores.clone(),
            audit.clone(),
            shared_location(),
            config,
        )
        .unwrap()
        .with_catalog(catalog);

        Self {
            backend,
            source,
            target,
            datastores,
            audit,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn add_org(&self, org_id: &str) {
        self.backend.add_org(org_id);
    }

    /// An organization already living on its dedicated database `tenant_<org>`
    pub fn add_dedicated_org(&self, org_id: &str) {
        self.backend.add_org(org_id);
        self.backend.move_org(org_id, dedicated_location(org_id));
    }

    pub fn seed_source(&self, collection: &str, org_id: &str, ids: &[&str]) {
        self.source.seed(collection, org_id, ids);
    }

    pub fn target_ids(&self, collection: &str, org_id: &str) -> Vec<String> {
        self.target.ids(collection, org_id)
    }
}

/// A fully copied migration waiting for cutover
pub struct CutoverFixture {
    pub backend: Arc<MemoryBackend>,
    pub source: Arc<MemoryDatastore>,
    pub target: Arc<MemoryDatastore>,
    pub record: MigrationRecord,
}

pub async fn ready_fixture(org_id: &str, rows: usize) -> CutoverFixture {
    let backend = Arc::new(MemoryBackend::new());
    backend.add_org(org_id);
    let source = Arc::new(MemoryDatastore::new(shared_location()));
    let target = Arc::new(MemoryDatastore::new(dedicated_location(org_id)));

    let ids: Vec<String> = (1..=rows).map(|i| format!("p{}", i)).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    source.seed("persons", org_id, &id_refs);
    target.seed("persons", org_id, &id_refs);

    let mut record = MigrationRecord::pending(
        org_id,
        MigrationDirection::SharedToDedicated,
        shared_location(),
        dedicated_location(org_id),
        MigrationOptions {
            chunk_size: 2,
            ..MigrationOptions::default()
        },
    );
    record.status = MigrationStatus::ReadyForCutover;
    record.collections_progress.insert(
        "persons".to_string(),
        CollectionProgress {
            total: rows as u64,
            copied: rows as u64,
            last_id: ids.last().cloned(),
            done: true,
        },
    );
    backend.insert_record(record.clone());

    CutoverFixture {
        backend,
        source,
        target,
        record,
    }
}
