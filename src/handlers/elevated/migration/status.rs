// handlers/elevated/migration/status.rs - GET /api/migration/status/:org_id handler

use axum::extract::{Path, State};

use super::MigrationView;
use crate::app::AppState;
use crate::middleware::{ApiResponse, ApiResult};

/// GET /api/migration/status/:org_id - Latest migration of an organization,
/// including per-collection progress. 404 when the organization was never migrated.
pub async fn migration_status(
    State(state): State<AppState>,
    Path(org_id): Path<String>,
) -> ApiResult<MigrationView> {
    let record = state.orchestrator.get_status(&org_id).await?;
    Ok(ApiResponse::success(record.into()))
}
