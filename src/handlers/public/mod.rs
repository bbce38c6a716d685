// handlers/public/mod.rs - Unauthenticated service endpoints

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::app::AppState;

/// GET / - Service description
pub async fn root() -> Json<Value> {
    let version = env!("CARGO_PKG_VERSION");

    Json(json!({
        "success": true,
        "data": {
            "name": "Tenant Migrator",
            "version": version,
            "description": "Moves organizations between the shared datastore and dedicated databases",
            "endpoints": {
                "home": "/ (public)",
                "health": "/health (public)",
                "start": "POST /api/migration/start (super admin)",
                "status": "GET /api/migration/status/:orgId (super admin)",
                "abort": "POST /api/migration/abort (super admin)",
                "finalize": "POST /api/migration/finalize (super admin)",
            }
        }
    }))
}

/// GET /health - System database reachability
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let now = chrono::Utc::now();

    let Some(database) = state.database.as_ref() else {
        return (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": { "status": "ok", "timestamp": now, "database": "not configured" }
            })),
        );
    };

    match database.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": {
                    "status": "ok",
                    "timestamp": now,
                    "database": "ok"
                }
            })),
        ),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "success": false,
                    "error": "database unavailable",
                    "data": {
                        "status": "degraded",
                        "timestamp": now
                    }
                })),
            )
        }
    }
}
