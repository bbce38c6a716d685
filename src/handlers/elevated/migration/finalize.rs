// handlers/elevated/migration/finalize.rs - POST /api/migration/finalize handler
// Verify the copy and switch the organization to its new datastore

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
pub struct FinalizeMigrationRequest {
    pub migration_id: Uuid,
    pub org_id: String,
    #[serde(default)]
    pub confirm_cutover: bool,
}

/**
 * POST /api/migration/finalize - Cut the organization over to the target datastore
 *
 * Only migrations in `ready_for_cutover` can be finalized. Row counts are
 * re-verified with writes frozen; on any mismatch the source stays
 * authoritative and the migration remains ready for another attempt.
 *
 * Expected Input:
 * ```json
 * { "migrationId": "uuid", "orgId": "42", "confirmCutover": true }
 * ```
 */
pub async fn migration_finalize(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: Result<Json<FinalizeMigrationRequest>, JsonRejection>,
) -> ApiResult<MigrationView> {
    let Json(body) = payload?;

    let record = state
        .orchestrator
        .finalize(body.migration_id, &body.org_id, body.confirm_cutover, &actor)
        .await?;

    Ok(ApiResponse::success(record.into()))
}
