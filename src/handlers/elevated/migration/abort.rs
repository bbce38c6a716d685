// handlers/elevated/migration/abort.rs - POST /api/migration/abort handler

use axum::{
    extract::{rejection::JsonRejection, State},
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::MigrationView;
use crate::app::AppState;
use crate::middleware::{ApiResponse, ApiResult};
use crate::types::Actor;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortMigrationRequest {
    pub migration_id: Uuid,
    pub org_id: String,
    pub reason: Option<String>,
}

/**
 * POST /api/migration/abort - Stop a migration that has not completed
 *
 * Target data already copied is left in place. Aborting an aborted
 * migration is a no-op; completed or failed migrations return 409.
 *
 * Expected Input:
 * ```json
 * { "migrationId": "uuid", "orgId": "42", "reason": "optional text" }
 * ```
 */
pub async fn migration_abort(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: Result<Json<AbortMigrationRequest>, JsonRejection>,
) -> ApiResult<MigrationView> {
    let Json(body) = payload?;

    let record = state
        .orchestrator
        .abort(body.migration_id, &body.org_id, body.reason, &actor)
        .await?;

    Ok(ApiResponse::success(record.into()))
}
