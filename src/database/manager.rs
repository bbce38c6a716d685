use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::types::{DatastoreKind, DatastoreLocation};

/// Errors from the system store, datastores and the pool manager
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("Invalid database URL")]
    InvalidDatabaseUrl,

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Postgres unique_violation, used to detect a second active migration
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        Self::has_code(err, "23505")
    }

    /// Postgres duplicate_database, raised when another process created it first
    pub fn is_duplicate_database(err: &sqlx::Error) -> bool {
        Self::has_code(err, "42P04")
    }

    fn has_code(err: &sqlx::Error, code: &str) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(code))
    }
}

/// Connection pool manager, one pool per resolved connection URL
#[derive(Clone)]
pub struct DatabaseManager {
    pools: Arc<RwLock<HashMap<String, PgPool>>>,
    config: DatabaseConfig,
}

impl DatabaseManager {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    fn base_url(&self) -> Result<&str, DatabaseError> {
        self.config
            .url
            .as_deref()
            .ok_or(DatabaseError::ConfigMissing("DATABASE_URL"))
    }

    /// Location of the system database (migration records, organizations, audit log)
    pub fn system_location(&self) -> Result<DatastoreLocation, DatabaseError> {
        Ok(DatastoreLocation::new(
            DatastoreKind::Shared,
            self.base_url()?,
            Some(self.config.system_db_name.clone()),
        ))
    }

    /// Location of the shared multi-tenant datastore
    pub fn shared_location(&self) -> Result<DatastoreLocation, DatabaseError> {
        Ok(DatastoreLocation::new(
            DatastoreKind::Shared,
            self.base_url()?,
            Some(self.config.shared_db_name.clone()),
        ))
    }

    pub async fn system_pool(&self) -> Result<PgPool, DatabaseError> {
        let location = self.system_location()?;
        self.pool_for(&location).await
    }

    /// Get existing pool or create a new one lazily
    pub async fn pool_for(&self, location: &DatastoreLocation) -> Result<PgPool, DatabaseError> {
        if let Some(db_name) = location.db_name.as_deref() {
            if !Self::is_valid_db_name(db_name) {
                return Err(DatabaseError::InvalidIdentifier(db_name.to_string()));
            }
        }
        let connection_string = location
            .connection_url()
            .map_err(|_| DatabaseError::InvalidDatabaseUrl)?;

        // Fast path: try read lock
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&connection_string) {
                return Ok(pool.clone());
            }
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(Duration::from_secs(self.config.connection_timeout))
            .connect(&connection_string)
            .await?;

        // Another task may have raced us here; keep whichever pool landed first
        let pool = {
            let mut pools = self.pools.write().await;
            pools.entry(connection_string).or_insert(pool).clone()
        };

        info!("Created database pool for: {}", location);
        Ok(pool)
    }

    /// Pool on the maintenance database of the server hosting `location`
    async fn admin_pool(&self, location: &DatastoreLocation) -> Result<PgPool, DatabaseError> {
        let admin = DatastoreLocation::new(
            location.kind,
            location.uri.clone(),
            Some(self.config.admin_db_name.clone()),
        );
        self.pool_for(&admin).await
    }

    /// Create the database named by `location` from the tenant template if
    /// it does not exist. Locations without a database name address an
    /// existing database through their URI and are left alone.
    pub async fn ensure_database(&self, location: &DatastoreLocation) -> Result<bool, DatabaseError> {
        let Some(db_name) = location.db_name.as_deref().filter(|name| !name.is_empty()) else {
            return Ok(false);
        };
        if !Self::is_valid_db_name(db_name) {
            return Err(DatabaseError::InvalidIdentifier(db_name.to_string()));
        }

        let admin_pool = self.admin_pool(location).await?;
        let existing: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(db_name)
            .fetch_optional(&admin_pool)
            .await?;
        if existing.is_some() {
            return Ok(false);
        }

        let template = self
            .config
            .tenant_template_db
            .as_deref()
            .ok_or(DatabaseError::ConfigMissing("DATABASE_TENANT_TEMPLATE"))?;
        if !Self::is_valid_db_name(template) {
            return Err(DatabaseError::InvalidIdentifier(template.to_string()));
        }

        let query = format!(
            "CREATE DATABASE {} WITH TEMPLATE {}",
            Self::quote_identifier(db_name),
            Self::quote_identifier(template)
        );
        match sqlx::query(&query).execute(&admin_pool).await {
            Ok(_) => {
                info!("Created database {} from template {}", db_name, template);
                Ok(true)
            }
            Err(e) if DatabaseError::is_duplicate_database(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Pings the system pool to ensure connectivity
    pub async fn health_check(&self) -> Result<(), DatabaseError> {
        let pool = self.system_pool().await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    /// Close and remove all pools (e.g., on shutdown)
    pub async fn close_all(&self) {
        let mut pools = self.pools.write().await;
        for (_, pool) in pools.drain() {
            pool.close().await;
        }
        info!("Closed all database pools");
    }

    /// Quote SQL identifier to prevent injection
    pub fn quote_identifier(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Database names are restricted to [a-zA-Z0-9_], 1..=63 chars
    pub fn is_valid_db_name(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 63
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}
