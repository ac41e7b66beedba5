//! HTTP endpoint handlers for the server action API

use super::controller::{Accepted, AppError, LiveImageController};
use crate::config::ApiServerConfig;
use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, HeaderMap},
    response::Json,
    routing::{get, post},
    Router,
};
use live_image_common::RequestContext;
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, instrument};

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const PROJECT_ID_HEADER: &str = "X-Project-Id";
pub const ROLES_HEADER: &str = "X-Roles";
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Shared application state
pub struct AppState {
    pub controller: Arc<LiveImageController>,
    pub config: ApiServerConfig,
}

/// Caller identity as established by the authenticating front end.
#[derive(Debug, Clone)]
pub struct CallerContext(pub RequestContext);

fn header_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let (Some(user_id), Some(project_id)) = (
            header_value(parts, USER_ID_HEADER),
            header_value(parts, PROJECT_ID_HEADER),
        ) else {
            debug!("Request without caller identity headers");
            return Err(AppError::Unauthorized(
                "Authentication required".to_string(),
            ));
        };

        let mut ctx = RequestContext::new(user_id, project_id);
        if let Some(roles) = header_value(parts, ROLES_HEADER) {
            ctx = ctx.with_roles(
                roles
                    .split(',')
                    .map(str::trim)
                    .filter(|role| !role.is_empty()),
            );
        }
        if let Some(request_id) = header_value(parts, REQUEST_ID_HEADER) {
            ctx = ctx.with_request_id(request_id);
        }

        Ok(CallerContext(ctx))
    }
}

/// Server action. Only `createLiveImage` is handled here.
#[instrument(skip(state, ctx, headers, body), fields(request_id = %ctx.request_id))]
pub async fn server_action(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    CallerContext(ctx): CallerContext,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Accepted, AppError> {
    let application_url = state.config.application_url(&headers);

    state
        .controller
        .live_snapshot(&ctx, &application_url, &instance_id, &body)
        .await
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// Routes relative to the API prefix.
pub fn live_image_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/servers/:id/action", post(server_action))
        .with_state(state)
}

/// Full application: API routes under the configured prefix plus `/health`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let prefix = state.config.api_prefix.clone();
    let api = live_image_routes(state);

    let router = if prefix.is_empty() {
        Router::new().merge(api)
    } else {
        Router::new().nest(&prefix, api)
    };

    router
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Tests
// ============================================================================
