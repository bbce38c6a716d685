use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::Arc;

use crate::database::catalog::CollectionSpec;
use crate::database::manager::{DatabaseError, DatabaseManager};
use crate::types::DatastoreLocation;

/// A source row: stable identifier plus the full row as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub id: String,
    pub body: Value,
}

/// One physical database holding organization collections.
///
/// Identifiers are compared as strings with byte ordering, which gives the
/// total order the copier's cursor relies on.
#[async_trait]
pub trait Datastore: Send + Sync {
    fn location(&self) -> &DatastoreLocation;

    async fn ping(&self) -> Result<(), DatabaseError>;

    async fn count(&self, collection: &CollectionSpec, org_id: &str) -> Result<u64, DatabaseError>;

    /// Up to `limit` rows with id > `after`, ascending by id
    async fn fetch_after(
        &self,
        collection: &CollectionSpec,
        org_id: &str,
        after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<SourceRow>, DatabaseError>;

    /// Replace-or-insert rows by id. Returns the number of rows written.
    async fn upsert(&self, collection: &CollectionSpec, rows: &[SourceRow]) -> Result<u64, DatabaseError>;

    /// Remove every row the organization owns in the collection
    async fn delete_org(&self, collection: &CollectionSpec, org_id: &str) -> Result<u64, DatabaseError>;
}

/// Opens datastores by location
#[async_trait]
pub trait DatastoreProvider: Send + Sync {
    async fn open(&self, location: &DatastoreLocation) -> Result<Arc<dyn Datastore>, DatabaseError>;

    /// Create the database behind `location` if it does not exist yet.
    /// Returns true when it was created.
    async fn provision(&self, location: &DatastoreLocation) -> Result<bool, DatabaseError>;
}

pub struct PgDatastore {
    location: DatastoreLocation,
    pool: PgPool,
}

impl PgDatastore {
    pub fn new(location: DatastoreLocation, pool: PgPool) -> Self {
        Self { location, pool }
    }
}

#[async_trait]
impl Datastore for PgDatastore {
    fn location(&self) -> &DatastoreLocation {
        &self.location
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn count(&self, collection: &CollectionSpec, org_id: &str) -> Result<u64, DatabaseError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}::text = $1",
            DatabaseManager::quote_identifier(&collection.table),
            DatabaseManager::quote_identifier(&collection.org_column),
        );
        let (count,): (i64,) = sqlx::query_as(&sql).bind(org_id).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_after(
        &self,
        collection: &CollectionSpec,
        org_id: &str,
        after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<SourceRow>, DatabaseError> {
        let sql = format!(
            r#"
            SELECT t.id::text AS id, to_jsonb(t) AS body
            FROM {table} t
            WHERE t.{org}::text = $1
            AND ($2::text IS NULL OR t.id::text COLLATE "C" > $2)
            ORDER BY t.id::text COLLATE "C"
            LIMIT $3
            "#,
            table = DatabaseManager::quote_identifier(&collection.table),
            org = DatabaseManager::quote_identifier(&collection.org_column),
        );
        let rows: Vec<(String, Value)> = sqlx::query_as(&sql)
            .bind(org_id)
            .bind(after)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id, body)| SourceRow { id, body }).collect())
    }

    async fn upsert(&self, collection: &CollectionSpec, rows: &[SourceRow]) -> Result<u64, DatabaseError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = DatabaseManager::quote_identifier(&collection.table);
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let bodies: Vec<&Value> = rows.iter().map(|r| &r.body).collect();

        // Delete-then-insert inside one transaction gives replace semantics
        // without having to know the table's column list.
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {} WHERE id::text = ANY($1)", table))
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1)",
            table = table
        ))
        .bind(Json(&bodies))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(inserted)
    }

    async fn delete_org(&self, collection: &CollectionSpec, org_id: &str) -> Result<u64, DatabaseError> {
        let sql = format!(
            "DELETE FROM {} WHERE {}::text = $1",
            DatabaseManager::quote_identifier(&collection.table),
            DatabaseManager::quote_identifier(&collection.org_column),
        );
        let deleted = sqlx::query(&sql)
            .bind(org_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

/// Postgres-backed provider sharing the pool cache of the DatabaseManager
pub struct PgDatastoreProvider {
    manager: DatabaseManager,
}

impl PgDatastoreProvider {
    pub fn new(manager: DatabaseManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl DatastoreProvider for PgDatastoreProvider {
    async fn open(&self, location: &DatastoreLocation) -> Result<Arc<dyn Datastore>, DatabaseError> {
        let pool = self.manager.pool_for(location).await?;
        Ok(Arc::new(PgDatastore::new(location.clone(), pool)))
    }

    async fn provision(&self, location: &DatastoreLocation) -> Result<bool, DatabaseError> {
        self.manager.ensure_database(location).await
    }
}
