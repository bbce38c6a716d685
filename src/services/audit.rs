use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::database::manager::DatabaseError;

/// One audit log entry per migration lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action: String,
    pub org_id: String,
    pub actor_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub detail: Value,
}

impl AuditEntry {
    pub fn new(action: &str, org_id: &str, actor_id: Option<String>, detail: Value) -> Self {
        Self {
            action: action.to_string(),
            org_id: org_id.to_string(),
            actor_id,
            timestamp: Utc::now(),
            detail,
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), DatabaseError>;
}

/// Writes entries to the system database audit_log table
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO audit_log (action, org_id, actor_id, detail, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&entry.action)
        .bind(&entry.org_id)
        .bind(&entry.actor_id)
        .bind(Json(&entry.detail))
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
