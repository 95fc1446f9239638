//! Route table: authentication endpoints, health probe, and the catch-all
//! reverse proxy, wrapped in the pipeline middleware stack.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Extension, Form, Json, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use serde::{Deserialize, Serialize};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{RequestContext, TokenPair, UserProfile};

use super::middleware as gw_middleware;
use super::proxy::proxy;
use super::state::AppState;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    tokens: TokenPair,
    user: UserProfile,
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct LogoutRequest {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    tenant_id: Uuid,
    username: String,
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Form(req): Form<LoginRequest>,
) -> Result<Response> {
    let user_agent = context.user_agent.as_deref().unwrap_or("");
    let outcome = state
        .orchestrator
        .login(&req.username, &req.password, &context.origin_ip, user_agent)?;
    Ok(Json(LoginResponse {
        tokens: outcome.tokens,
        user: outcome.user,
        session_id: outcome.session_id,
    })
    .into_response())
}

async fn refresh_handler(State(state): State<Arc<AppState>>, Json(req): Json<RefreshRequest>) -> Result<Response> {
    let tokens = state.orchestrator.refresh(&req.refresh_token)?;
    Ok(Json(tokens).into_response())
}

async fn logout_handler(State(state): State<Arc<AppState>>, Json(req): Json<LogoutRequest>) -> Response {
    state.orchestrator.logout(req.token.as_deref());
    StatusCode::NO_CONTENT.into_response()
}

async fn register_handler(State(state): State<Arc<AppState>>, Json(req): Json<RegisterRequest>) -> Result<Response> {
    let profile = state
        .orchestrator
        .register(req.tenant_id, &req.username, &req.email, &req.password)?;
    Ok((StatusCode::CREATED, Json(profile)).into_response())
}

async fn health_handler() -> Response {
    Json(HealthResponse { status: "ok" }).into_response()
}

fn cors_layer(config: &crate::config::CorsConfig) -> CorsLayer {
    if config.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<_> = config.allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
            .allow_headers(Any)
    }
}

/// Build the gateway's axum router.
///
/// Credential-selection endpoints (C7) are deliberately absent here — they
/// are internal-only and must never be reachable from the public gateway
/// surface.
#[must_use]
pub fn build(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.cors);

    let auth_routes = Router::new()
        .route("/api/v1/auth/token", post(login_handler))
        .route("/api/v1/auth/refresh", post(refresh_handler))
        .route("/api/v1/auth/logout", post(logout_handler))
        .route("/api/v1/auth/register", post(register_handler));

    let proxied = Router::new().route("/{*path}", any(proxy));

    Router::new()
        .route("/health", get(health_handler))
        .merge(auth_routes)
        .merge(proxied)
        .layer(axum::middleware::from_fn_with_state(state.clone(), gw_middleware::rate_limit_admission))
        .layer(axum::middleware::from_fn_with_state(state.clone(), gw_middleware::attach_principal))
        .layer(axum::middleware::from_fn(gw_middleware::security_headers))
        .layer(cors)
        .layer(axum::middleware::from_fn(gw_middleware::request_context))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
