//! Reverse-proxy handler: strips hop-by-hop headers, injects the
//! authenticated identity headers (discarding any the caller supplied, so a
//! forged `X-User-Id` never survives), forwards the body, and streams
//! server-sent-event responses through unbuffered.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::RequestContext;

use super::state::AppState;

const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "x-user-id",
    "x-tenant-id",
    "x-user-role",
    "x-user-email",
];

const STRIPPED_RESPONSE_HEADERS: &[&str] =
    &["connection", "keep-alive", "transfer-encoding", "content-length"];

fn is_stream_request(headers: &HeaderMap, uri: &Uri) -> bool {
    let accepts_events = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"));
    if accepts_events {
        return true;
    }

    let stream_param = uri.query().is_some_and(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .any(|(k, v)| k == "stream" && matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
    });
    if stream_param {
        return true;
    }

    uri.path().contains("/stream")
}

fn build_downstream_request(
    client: &reqwest::Client,
    method: &Method,
    target_url: &str,
    inbound_headers: &HeaderMap,
    context: &RequestContext,
    body: bytes::Bytes,
) -> reqwest::RequestBuilder {
    let reqwest_method =
        reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut builder = client.request(reqwest_method, target_url);

    for (name, value) in inbound_headers {
        let lower = name.as_str().to_ascii_lowercase();
        if STRIPPED_REQUEST_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            builder = builder.header(name.as_str(), value);
        }
    }

    builder = builder.header("x-request-id", &context.request_id);
    if let Some(principal) = &context.principal {
        builder = builder
            .header("x-user-id", principal.user_id.to_string())
            .header("x-tenant-id", principal.tenant_id.to_string())
            .header("x-user-role", &principal.role)
            .header("x-user-email", &principal.email);
    }

    if !body.is_empty() {
        builder = builder.body(body);
    }
    builder
}

fn translate_send_error(err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::DownstreamTimeout(err.to_string())
    } else if err.is_connect() {
        Error::DownstreamUnavailable(err.to_string())
    } else {
        let mut message = err.to_string();
        message.truncate(500);
        Error::DownstreamError(message)
    }
}

#[derive(Deserialize)]
struct UpstreamErrorEnvelope {
    error: UpstreamErrorDetail,
}

#[derive(Deserialize)]
struct UpstreamErrorDetail {
    code: String,
    message: String,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ReemittedErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ReemittedErrorEnvelope {
    success: bool,
    error: ReemittedErrorBody,
    request_id: String,
    timestamp: String,
}

/// Translate a non-2xx upstream response per the error-translation contract:
/// a conforming `{error:{code,message,details}}` body is re-emitted verbatim
/// under the gateway's own request-id (patched in later by
/// `middleware::stamp_error_envelope`); anything else is wrapped as a
/// `5003` downstream error with a truncated body excerpt.
fn translate_upstream_error_body(status: StatusCode, body: &[u8]) -> Response {
    if let Ok(parsed) = serde_json::from_slice::<UpstreamErrorEnvelope>(body) {
        let envelope = ReemittedErrorEnvelope {
            success: false,
            error: ReemittedErrorBody {
                code: parsed.error.code,
                message: parsed.error.message,
                details: parsed.error.details,
            },
            request_id: String::new(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        return (status, Json(envelope)).into_response();
    }

    let mut excerpt = String::from_utf8_lossy(body).into_owned();
    excerpt.truncate(500);
    Error::DownstreamError(excerpt).into_response()
}

fn copy_response_headers(source: &reqwest::header::HeaderMap, dest: &mut HeaderMap) {
    for (name, value) in source {
        let lower = name.as_str();
        if STRIPPED_RESPONSE_HEADERS.contains(&lower) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            dest.insert(name, value);
        }
    }
}

/// Forward one request to the downstream service matched by the route
/// table. Authentication enforcement (`require_auth`) happens here, once
/// the matching route is known — a route without `require_auth` must still
/// be reachable by unauthenticated callers.
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    axum::extract::Extension(context): axum::extract::Extension<RequestContext>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = uri.path();
    let Some(route) = state.routes.match_path(path) else {
        return Error::NotFound(path.to_string()).into_response();
    };

    if route.config.require_auth && context.principal.is_none() {
        return Error::Unauthenticated("bearer token required".to_string()).into_response();
    }

    let remaining = path.strip_prefix(route.prefix.as_str()).unwrap_or("");
    let remaining = if remaining.is_empty() { "/" } else if remaining.starts_with('/') {
        remaining
    } else {
        return Error::Internal("route prefix did not align on a path boundary".to_string()).into_response();
    };
    let target_url = match uri.query() {
        Some(q) => format!("{}{}?{}", route.config.target_base_url.trim_end_matches('/'), remaining, q),
        None => format!("{}{}", route.config.target_base_url.trim_end_matches('/'), remaining),
    };

    let body_bytes = match axum::body::to_bytes(body, 16 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(err) => return Error::InvalidInput(err.to_string()).into_response(),
    };

    let timeout = route.config.timeout.unwrap_or(state.default_request_timeout);
    let builder = build_downstream_request(&state.http_client, &method, &target_url, &headers, &context, body_bytes)
        .timeout(timeout);

    let upstream = match builder.send().await {
        Ok(resp) => resp,
        Err(err) => return translate_send_error(&err).into_response(),
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    if !upstream.status().is_success() {
        let bytes = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => return translate_send_error(&err).into_response(),
        };
        return translate_upstream_error_body(status, &bytes);
    }

    let mut response_headers = HeaderMap::new();
    copy_response_headers(upstream.headers(), &mut response_headers);

    let streaming = is_stream_request(&headers, &uri)
        || upstream
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"));

    let body = if streaming {
        let stream = upstream.bytes_stream().map(|chunk| {
            chunk.map_err(|err| std::io::Error::other(err.to_string()))
        });
        Body::from_stream(stream)
    } else {
        match upstream.bytes().await {
            Ok(bytes) => Body::from(bytes),
            Err(err) => return translate_send_error(&err).into_response(),
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

/// Periodic no-op keepalive for connection pool warmth; downstream deadlines
/// are enforced per-request via `route.config.timeout`, not here.
#[must_use]
pub fn default_client(connect_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_default()
}
