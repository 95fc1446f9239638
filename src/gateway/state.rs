//! Shared application state threaded through every handler and middleware
//! layer via `axum::extract::State`.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;

use crate::config::{CorsConfig, RouteConfig};
use crate::orchestrator::AuthOrchestrator;
use crate::ratelimit::RateLimiter;
use crate::token::TokenService;

/// One entry in the longest-prefix route table.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    /// Path prefix this entry matches.
    pub prefix: String,
    /// Route configuration.
    pub config: RouteConfig,
}

/// Prefix map from `Config::routes`, queried by longest match.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<ResolvedRoute>,
}

impl RouteTable {
    /// Build a route table from the configuration map, pre-sorted so the
    /// longest prefix is checked first.
    #[must_use]
    pub fn new(routes: HashMap<String, RouteConfig>) -> Self {
        let mut entries: Vec<ResolvedRoute> = routes
            .into_iter()
            .map(|(prefix, config)| ResolvedRoute { prefix, config })
            .collect();
        entries.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes: entries }
    }

    /// Find the longest matching prefix for `path`.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<&ResolvedRoute> {
        self.routes.iter().find(|r| path.starts_with(&r.prefix))
    }
}

/// Shared state for the gateway's axum router.
pub struct AppState {
    /// Authentication orchestrator (login/refresh/logout/register).
    pub orchestrator: Arc<AuthOrchestrator>,
    /// Token service, used directly by the auth-extraction middleware.
    pub tokens: Arc<TokenService>,
    /// Rate limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// Downstream route table.
    pub routes: RouteTable,
    /// CORS configuration.
    pub cors: CorsConfig,
    /// HTTP client used to proxy requests to downstream services.
    pub http_client: Client,
    /// Per-downstream-call deadline, used when a route does not override it.
    pub default_request_timeout: std::time::Duration,
}
