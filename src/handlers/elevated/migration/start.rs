// handlers/elevated/migration/start.rs - POST /api/migration/start handler
// Begin (or resume) copying an organization to another datastore

use axum::{
    extract::{rejection::JsonRejection, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::{ApiResponse, ApiResult};
use crate::services::StartMigration;
use crate::types::{Actor, DatastoreKind, MigrationDirection};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMigrationRequest {
    pub org_id: String,
    pub target_datastore_type: String,
    pub direction: Option<String>,
    pub target_uri: Option<String>,
    pub target_db_name: Option<String>,
    pub dry_run: Option<bool>,
    pub resume: Option<bool>,
    pub override_legal_hold: Option<bool>,
    pub chunk_size: Option<u32>,
}

impl StartMigrationRequest {
    pub fn into_command(self) -> Result<StartMigration, ApiError> {
        let kind = DatastoreKind::parse(self.target_datastore_type.trim()).ok_or_else(|| {
            ApiError::field_error("targetDatastoreType", "must be 'shared' or 'dedicated'")
        })?;

        let direction = match self.direction.as_deref() {
            None => MigrationDirection::towards(kind),
            Some(raw) => {
                let direction = MigrationDirection::parse(raw.trim()).ok_or_else(|| {
                    ApiError::field_error(
                        "direction",
                        "must be 'shared_to_dedicated' or 'dedicated_to_shared'",
                    )
                })?;
                if direction.target_kind() != kind {
                    return Err(ApiError::bad_request(format!(
                        "direction {} does not move to a {} datastore",
                        direction.as_str(),
                        kind.as_str()
                    )));
                }
                direction
            }
        };

        Ok(StartMigration {
            org_id: self.org_id,
            direction,
            target_uri: self.target_uri,
            target_db_name: self.target_db_name,
            dry_run: self.dry_run.unwrap_or(false),
            resume: self.resume.unwrap_or(false),
            override_legal_hold: self.override_legal_hold.unwrap_or(false),
            chunk_size: self.chunk_size,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMigrationResponse {
    pub migration_id: Uuid,
    pub org_id: String,
    pub status: &'static str,
}

/**
 * POST /api/migration/start - Start copying an organization's data
 *
 * Returns as soon as the migration is in progress; the copy continues in the
 * background and is observed through the status endpoint.
 *
 * Expected Input:
 * ```json
 * {
 *   "orgId": "42",                       // Required
 *   "targetDatastoreType": "dedicated",  // Required: "dedicated" | "shared"
 *   "targetUri": "postgres://host:5432", // Optional: defaults to the shared server
 *   "targetDbName": "tenant_42",         // Optional
 *   "dryRun": false,                     // Optional: count only, write nothing
 *   "resume": false,                     // Optional: continue an earlier attempt
 *   "overrideLegalHold": false,          // Optional
 *   "chunkSize": 100                     // Optional: 1-5000
 * }
 * ```
 *
 * @returns 202 with `{ migrationId, orgId, status }`
 */
pub async fn migration_start(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: Result<Json<StartMigrationRequest>, JsonRejection>,
) -> ApiResult<StartMigrationResponse> {
    let Json(body) = payload?;
    let command = body.into_command()?;

    let record = state.orchestrator.start(command, &actor).await?;

    Ok(ApiResponse::accepted(StartMigrationResponse {
        migration_id: record.id,
        org_id: record.org_id,
        status: record.status.as_str(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: &str, direction: Option<&str>) -> StartMigrationRequest {
        StartMigrationRequest {
            org_id: "42".into(),
            target_datastore_type: kind.into(),
            direction: direction.map(str::to_string),
            target_uri: None,
            target_db_name: None,
            dry_run: None,
            resume: Some(true),
            override_legal_hold: None,
            chunk_size: Some(50),
        }
    }

    #[test]
    fn direction_defaults_from_target_type() {
        let command = request("dedicated", None).into_command().unwrap();
        assert_eq!(command.direction, MigrationDirection::SharedToDedicated);
        assert!(command.resume);
        assert!(!command.dry_run);
        assert_eq!(command.chunk_size, Some(50));

        let command = request("shared", None).into_command().unwrap();
        assert_eq!(command.direction, MigrationDirection::DedicatedToShared);
    }

    #[test]
    fn contradicting_direction_is_rejected() {
        let err = request("shared", Some("shared_to_dedicated")).into_command().unwrap_err();
        assert_eq!(err.status_code(), 400);
        let err = request("cloud", None).into_command().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
