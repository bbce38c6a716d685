use axum::{http::HeaderValue, middleware::from_fn_with_state, routing::get, Router};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::config::SecurityConfig;
use crate::database::DatabaseManager;
use crate::handlers;
use crate::middleware::{jwt_auth_middleware, require_migrate_capability, CapabilityGate};
use crate::services::MigrationOrchestrator;

/// Shared state handed to every handler and middleware
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<MigrationOrchestrator>,
    pub gate: Arc<dyn CapabilityGate>,
    pub security: SecurityConfig,
    /// Pool manager for the health endpoint; None when running without a database
    pub database: Option<DatabaseManager>,
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.security);

    Router::new()
        // Public
        .route("/", get(handlers::public::root))
        .route("/health", get(handlers::public::health))
        // Super admin
        .merge(migration_routes(state.clone()))
        // Global middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn migration_routes(state: AppState) -> Router<AppState> {
    use axum::routing::post;
    use handlers::elevated::migration;

    Router::new()
        .route("/api/migration/start", post(migration::migration_start))
        .route("/api/migration/status/:org_id", get(migration::migration_status))
        .route("/api/migration/abort", post(migration::migration_abort))
        .route("/api/migration/finalize", post(migration::migration_finalize))
        // route_layer: the last layer added runs first
        .route_layer(from_fn_with_state(state.clone(), require_migrate_capability))
        .route_layer(from_fn_with_state(state, jwt_auth_middleware))
}

fn cors_layer(security: &SecurityConfig) -> CorsLayer {
    if !security.enable_cors {
        return CorsLayer::new();
    }
    if security.cors_origins.is_empty() || security.cors_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = security
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(origins))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{generate_jwt, Claims};
    use crate::middleware::RoleGate;
    use crate::testing::Harness;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    fn app(harness: &Harness) -> Router {
        router(AppState {
            orchestrator: harness.orchestrator.clone(),
            gate: Arc::new(RoleGate::default()),
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec!["*".to_string()],
                jwt_secret: SECRET.to_string(),
                jwt_expiry_hours: 1,
            },
            database: None,
        })
    }

    fn token(role: &str) -> String {
        generate_jwt(&Claims::new("ops-1", Some(role.to_string()), 1), SECRET).unwrap()
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<String>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn start_body(org_id: &str) -> String {
        json!({ "orgId": org_id, "targetDatastoreType": "dedicated", "chunkSize": 2 }).to_string()
    }

    #[tokio::test]
    async fn public_routes_need_no_token() {
        let harness = Harness::new();
        let app = app(&harness);

        let (status, body) = send(&app, Method::GET, "/", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["name"], "Tenant Migrator");

        let (status, body) = send(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn migration_routes_require_super_admin() {
        let harness = Harness::new();
        harness.add_org("42");
        let app = app(&harness);

        let (status, body) =
            send(&app, Method::POST, "/api/migration/start", None, Some(start_body("42"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");

        let (status, _) = send(
            &app,
            Method::GET,
            "/api/migration/status/42",
            Some("not-a-jwt"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let admin = token("admin");
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/migration/start",
            Some(&admin),
            Some(start_body("42")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], true);
        assert!(harness.orchestrator.get_status("42").await.is_err());
    }

    #[tokio::test]
    async fn start_status_and_finalize_over_http() {
        let harness = Harness::new();
        harness.add_org("42");
        harness.seed_source("persons", "42", &["p1", "p2", "p3"]);
        let app = app(&harness);
        let token = token("super_admin");

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/migration/start",
            Some(&token),
            Some(start_body("42")),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["orgId"], "42");
        assert_eq!(body["data"]["status"], "in_progress");
        let migration_id = body["data"]["migrationId"].as_str().unwrap().to_string();

        harness.orchestrator.join_driver("42").await;

        let (status, body) =
            send(&app, Method::GET, "/api/migration/status/42", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ready_for_cutover");
        assert_eq!(body["data"]["collectionsProgress"]["persons"]["copied"], 3);
        assert_eq!(body["data"]["totalCopied"], 3);
        assert_eq!(body["data"]["actorId"], "ops-1");
        assert!(!body["data"]["target"].as_str().unwrap().contains("postgres://"));

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/migration/finalize",
            Some(&token),
            Some(json!({ "migrationId": migration_id, "orgId": "42", "confirmCutover": true }).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "completed");
    }

    #[tokio::test]
    async fn domain_errors_map_to_http_codes() {
        let harness = Harness::new();
        harness.add_org("7");
        harness.backend.set_legal_hold("7", true);
        let app = app(&harness);
        let token = token("super_admin");

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/migration/start",
            Some(&token),
            Some(start_body("7")),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "CONFLICT");

        let (status, _) =
            send(&app, Method::GET, "/api/migration/status/7", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/migration/start",
            Some(&token),
            Some("{not json".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_JSON");

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/migration/start",
            Some(&token),
            Some(json!({ "orgId": "7", "targetDatastoreType": "dedicated", "chunkSize": 0 }).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/migration/abort",
            Some(&token),
            Some(json!({ "migrationId": uuid::Uuid::new_v4(), "orgId": "7" }).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }
}
