use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::MigrationConfig;
use crate::database::catalog::{CollectionCatalog, CollectionSpec};
use crate::database::datastore::Datastore;
use crate::database::manager::DatabaseError;
use crate::services::error::MigrationError;

/// Result of one copied chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub copied_count: u64,
    /// Identifier of the last row read, or the incoming cursor when nothing was read
    pub new_cursor: Option<String>,
    pub done: bool,
}

/// Copies one organization's collections between a source and a target
/// datastore, one bounded chunk at a time.
pub struct CollectionCopier {
    source: Arc<dyn Datastore>,
    target: Arc<dyn Datastore>,
    catalog: CollectionCatalog,
    config: MigrationConfig,
}

impl CollectionCopier {
    pub fn new(
        source: Arc<dyn Datastore>,
        target: Arc<dyn Datastore>,
        catalog: CollectionCatalog,
        config: MigrationConfig,
    ) -> Self {
        Self {
            source,
            target,
            catalog,
            config,
        }
    }

    fn collection(&self, name: &str) -> Result<&CollectionSpec, MigrationError> {
        self.catalog
            .get(name)
            .ok_or_else(|| MigrationError::bad_request(format!("Unknown collection '{}'", name)))
    }

    pub async fn source_count(&self, collection: &str, org_id: &str) -> Result<u64, MigrationError> {
        let spec = self.collection(collection)?;
        Ok(self.source.count(spec, org_id).await?)
    }

    pub async fn target_count(&self, collection: &str, org_id: &str) -> Result<u64, MigrationError> {
        let spec = self.collection(collection)?;
        Ok(self.target.count(spec, org_id).await?)
    }

    /// Remove every row of the organization from the target collection
    pub async fn clear_target(&self, collection: &str, org_id: &str) -> Result<u64, MigrationError> {
        let spec = self.collection(collection)?;
        Ok(self.target.delete_org(spec, org_id).await?)
    }

    /// Copy the next chunk after `from_cursor`.
    ///
    /// Each attempt reads and writes the whole chunk under the configured
    /// write timeout. Failed attempts are retried with exponential backoff;
    /// once attempts are exhausted the error is `ChunkCopyFailed` and the
    /// caller keeps its cursor. Writes replace rows by id, so retrying a
    /// partially applied chunk never duplicates target rows.
    pub async fn copy_chunk(
        &self,
        org_id: &str,
        collection: &str,
        from_cursor: Option<&str>,
        chunk_size: u32,
        dry_run: bool,
    ) -> Result<ChunkOutcome, MigrationError> {
        if chunk_size == 0 {
            return Err(MigrationError::bad_request("chunkSize must be positive"));
        }
        let spec = self.collection(collection)?;
        let attempts = self.config.chunk_retry_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let message = match timeout(
                self.config.chunk_write_timeout(),
                self.attempt_chunk(spec, org_id, from_cursor, chunk_size, dry_run),
            )
            .await
            {
                Ok(Ok(outcome)) => {
                    debug!(
                        "Copied {} rows of {} for org {} (cursor {:?} -> {:?})",
                        outcome.copied_count, collection, org_id, from_cursor, outcome.new_cursor
                    );
                    return Ok(outcome);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "chunk attempt timed out after {:?}",
                    self.config.chunk_write_timeout()
                ),
            };

            if attempt >= attempts {
                return Err(MigrationError::ChunkCopyFailed {
                    collection: collection.to_string(),
                    cursor: from_cursor.map(str::to_string),
                    attempts: attempt,
                    message,
                });
            }

            let delay = self.config.backoff_delay(attempt);
            warn!(
                "Chunk attempt {}/{} for {} (org {}) failed: {}; retrying in {:?}",
                attempt, attempts, collection, org_id, message, delay
            );
            sleep(delay).await;
        }
    }

    async fn attempt_chunk(
        &self,
        spec: &CollectionSpec,
        org_id: &str,
        from_cursor: Option<&str>,
        chunk_size: u32,
        dry_run: bool,
    ) -> Result<ChunkOutcome, DatabaseError> {
        let rows = self
            .source
            .fetch_after(spec, org_id, from_cursor, chunk_size)
            .await?;

        if !dry_run && !rows.is_empty() {
            self.target.upsert(spec, &rows).await?;
        }

        let copied_count = rows.len() as u64;
        let new_cursor = rows
            .last()
            .map(|row| row.id.clone())
            .or_else(|| from_cursor.map(str::to_string));

        Ok(ChunkOutcome {
            copied_count,
            new_cursor,
            done: copied_count < u64::from(chunk_size),
        })
    }
}
