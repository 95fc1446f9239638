//! Pipeline middleware: request-id assignment, security headers, rate-limit
//! admission, and bearer-token authentication. Applied in the order the
//! pipeline is documented — layers added last to the router run first on
//! the way in, so the call site in `router::build` lists them bottom-up.

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderName, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;

use crate::error::Error;
use crate::model::{Principal, RequestContext, TokenKind};

use super::state::AppState;

const HEADER_REQUEST_ID: &str = "x-request-id";

fn generate_request_id() -> String {
    format!("req-{}-{:08x}", chrono::Utc::now().timestamp_millis(), rand::random::<u32>())
}

/// Assign or propagate `X-Request-Id`, building the [`RequestContext`] that
/// every later layer and handler reads from request extensions.
pub async fn request_context(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(generate_request_id, ToString::to_string);

    let origin_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map_or_else(|| peer.ip().to_string(), |v| v.trim().to_string());

    let user_agent = request
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let context = RequestContext {
        request_id: request_id.clone(),
        principal: None,
        origin_ip,
        user_agent,
    };
    request.extensions_mut().insert(context);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(HeaderName::from_static("x-request-id"), value);
    }
    stamp_error_envelope(response, &request_id).await
}

/// Error envelopes are built deep inside handlers, before the request id
/// minted here exists, so [`crate::error::Error`]'s `IntoResponse` leaves the
/// `request_id` field blank. Patch it in on the way out rather than threading
/// the id through every fallible call site.
async fn stamp_error_envelope(response: Response, request_id: &str) -> Response {
    if !response.status().is_client_error() && !response.status().is_server_error() {
        return response;
    }
    let is_json = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if !is_json {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let Ok(bytes) = to_bytes(body, 64 * 1024).await else {
        return Response::from_parts(parts, Body::empty());
    };
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
        return Response::from_parts(parts, Body::from(bytes));
    };
    if let Some(obj) = value.as_object_mut() {
        if obj.contains_key("request_id") {
            obj.insert("request_id".to_string(), serde_json::Value::String(request_id.to_string()));
        }
    }
    let Ok(patched) = serde_json::to_vec(&value) else {
        return Response::from_parts(parts, Body::from(bytes));
    };
    parts.headers.remove(axum::http::header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(patched))
}

/// Inject a fixed set of security headers onto every response.
pub async fn security_headers(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    response
}

/// Best-effort bearer-token extraction: populates `RequestContext::principal`
/// when a valid access token is present, but never rejects the request here.
/// Route-level enforcement (`require_auth`) happens in the proxy handler,
/// once the route table has been consulted.
pub async fn attach_principal(State(state): State<Arc<AppState>>, mut request: Request<Body>, next: Next) -> Response {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")));

    if let Some(token) = token {
        if let Ok(claims) = state.tokens.verify(token, TokenKind::Access) {
            if let Some(context) = request.extensions_mut().get_mut::<RequestContext>() {
                context.principal = Some(Principal {
                    user_id: claims.sub,
                    tenant_id: claims.tenant_id,
                    role: claims.role,
                    email: claims.email,
                    permissions: claims.permissions,
                });
            }
        }
    }

    next.run(request).await
}

/// Rate-limit admission: global, per-ip, per-user (when a principal was
/// already attached by [`attach_principal`]), and per-endpoint scopes.
/// Denial short-circuits the pipeline with a 429 before any route or auth
/// logic runs.
pub async fn rate_limit_admission(State(state): State<Arc<AppState>>, request: Request<Body>, next: Next) -> Response {
    let context = request.extensions().get::<RequestContext>().cloned();
    let Some(context) = context else {
        return next.run(request).await;
    };

    let endpoint_key = format!("{} {}", request.method(), request.uri().path());
    let user_id = context.principal.as_ref().map(|p| p.user_id.to_string());
    let role = context.principal.as_ref().map(|p| p.role.clone());

    match state
        .rate_limiter
        .check(&context.origin_ip, user_id.as_deref(), role.as_deref(), &endpoint_key)
    {
        Ok(results) => {
            let mut response = next.run(request).await;
            for (name, value) in crate::ratelimit::headers_for(&results) {
                if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(&value)) {
                    response.headers_mut().insert(name, value);
                }
            }
            response
        }
        Err(denial) => Error::RateLimited {
            scope: denial.scope.as_str().to_string(),
            retry_after_secs: denial.retry_after_secs,
        }
        .into_response(),
    }
}
