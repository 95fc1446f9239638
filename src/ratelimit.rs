//! C3: Rate Limiter. Composes four sliding-window scopes — global, per-ip,
//! per-user, per-endpoint — over [`crate::store::KeyValueStore::window_admit`],
//! denying on the first scope that rejects and reporting which one.

use std::sync::Arc;

use crate::config::{LimitWindow, RateLimitConfig};
use crate::store::{KeyValueStore, KeyValueStoreExt};

/// Which scope denied a request, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Applies to every request regardless of caller.
    Global,
    /// Applies per client IP.
    PerIp,
    /// Applies per authenticated user.
    PerUser,
    /// Applies per `METHOD path`, using the configured override or default.
    PerEndpoint,
}

impl Scope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::PerIp => "ip",
            Self::PerUser => "user",
            Self::PerEndpoint => "endpoint",
        }
    }
}

/// Outcome of a rate-limit check for a single scope, used to build
/// `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy)]
pub struct ScopeResult {
    /// Which scope this describes.
    pub scope: Scope,
    /// Whether this scope admitted the request.
    pub admitted: bool,
    /// The effective limit applied (after role multiplier, for `PerUser`).
    pub limit: u32,
    /// Requests admitted so far within the current window, including this
    /// one if admitted.
    pub count: u32,
    /// Seconds until the window resets.
    pub reset_secs: u64,
}

/// A denial, carrying enough detail for the gateway to build both the
/// client-facing error and the `Retry-After` header.
#[derive(Debug, Clone)]
pub struct Denial {
    /// The scope that denied the request.
    pub scope: Scope,
    /// Seconds the caller should wait before retrying.
    pub retry_after_secs: u64,
}

/// Checks requests against the four-scope sliding-window policy.
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn KeyValueStore>,
}

impl RateLimiter {
    /// Build a limiter from configuration and a backing store.
    #[must_use]
    pub fn new(config: RateLimitConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self { config, store }
    }

    fn effective_window(&self, base: LimitWindow, role: Option<&str>) -> LimitWindow {
        let multiplier = role
            .and_then(|r| self.config.role_multipliers.get(r))
            .copied()
            .unwrap_or(1.0);
        if (multiplier - 1.0).abs() < f64::EPSILON {
            return base;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scaled_limit = ((f64::from(base.limit)) * multiplier).round() as u32;
        LimitWindow {
            limit: scaled_limit.max(1),
            horizon: base.horizon,
        }
    }

    fn endpoint_window(&self, endpoint_key: &str) -> LimitWindow {
        self.config
            .per_endpoint_overrides
            .get(endpoint_key)
            .copied()
            .unwrap_or(self.config.per_endpoint_default)
    }

    fn check_scope(&self, scope: Scope, key: &str, window: LimitWindow) -> ScopeResult {
        let (admitted, count) = self.store.window_admit(key, window.limit, window.horizon);
        ScopeResult {
            scope,
            admitted,
            limit: window.limit,
            count,
            reset_secs: window.horizon.as_secs(),
        }
    }

    /// Evaluate all four scopes for one request, short-circuiting on the
    /// first denial. Returns every scope result checked (not all four, if
    /// one denies early) so the caller can still emit headers for the scopes
    /// that ran.
    ///
    /// `endpoint_key` is `"METHOD path"`, e.g. `"POST /api/v1/auth/token"`.
    #[tracing::instrument(skip(self), fields(ip = %client_ip, endpoint = %endpoint_key))]
    pub fn check(
        &self,
        client_ip: &str,
        user_id: Option<&str>,
        role: Option<&str>,
        endpoint_key: &str,
    ) -> Result<Vec<ScopeResult>, Denial> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(4);

        let global = self.check_scope(Scope::Global, "ratelimit:global", self.config.global);
        results.push(global);
        if !global.admitted {
            record_denial(Scope::Global);
            return Err(Denial {
                scope: Scope::Global,
                retry_after_secs: global.reset_secs,
            });
        }

        let ip_key = format!("ratelimit:ip:{client_ip}");
        let ip_result = self.check_scope(Scope::PerIp, &ip_key, self.config.per_ip);
        results.push(ip_result);
        if !ip_result.admitted {
            record_denial(Scope::PerIp);
            return Err(Denial {
                scope: Scope::PerIp,
                retry_after_secs: ip_result.reset_secs,
            });
        }

        if let Some(uid) = user_id {
            let window = self.effective_window(self.config.per_user, role);
            let user_key = format!("ratelimit:user:{uid}");
            let user_result = self.check_scope(Scope::PerUser, &user_key, window);
            results.push(user_result);
            if !user_result.admitted {
                record_denial(Scope::PerUser);
                return Err(Denial {
                    scope: Scope::PerUser,
                    retry_after_secs: user_result.reset_secs,
                });
            }
        }

        let endpoint_window = self.endpoint_window(endpoint_key);
        let endpoint_key_full = format!("ratelimit:endpoint:{endpoint_key}");
        let endpoint_result = self.check_scope(Scope::PerEndpoint, &endpoint_key_full, endpoint_window);
        results.push(endpoint_result);
        if !endpoint_result.admitted {
            record_denial(Scope::PerEndpoint);
            return Err(Denial {
                scope: Scope::PerEndpoint,
                retry_after_secs: endpoint_result.reset_secs,
            });
        }

        telemetry_metrics::counter!("ratelimit_admissions_total").increment(1);
        Ok(results)
    }
}

fn record_denial(scope: Scope) {
    telemetry_metrics::counter!("ratelimit_denials_total", "scope" => scope.as_str()).increment(1);
}

/// Build the `X-RateLimit-{Scope}-{Limit,Remaining,Reset}` header set for a
/// successful check, one triple per scope evaluated.
#[must_use]
pub fn headers_for(results: &[ScopeResult]) -> Vec<(String, String)> {
    let mut headers = Vec::with_capacity(results.len() * 3);
    for result in results {
        let prefix = format!("X-RateLimit-{}", capitalize(result.scope.as_str()));
        let remaining = result.limit.saturating_sub(result.count);
        headers.push((format!("{prefix}-Limit"), result.limit.to_string()));
        headers.push((format!("{prefix}-Remaining"), remaining.to_string()));
        headers.push((format!("{prefix}-Reset"), result.reset_secs.to_string()));
    }
    headers
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::time::Duration;

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(config, Arc::new(InMemoryStore::new()))
    }

    fn small_config() -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            strict_atomic: true,
            global: LimitWindow {
                limit: 100,
                horizon: Duration::from_secs(60),
            },
            per_ip: LimitWindow {
                limit: 3,
                horizon: Duration::from_secs(60),
            },
            per_user: LimitWindow {
                limit: 100,
                horizon: Duration::from_secs(60),
            },
            per_endpoint_default: LimitWindow {
                limit: 100,
                horizon: Duration::from_secs(60),
            },
            per_endpoint_overrides: std::collections::HashMap::new(),
            role_multipliers: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn admits_until_per_ip_bound_then_denies() {
        let limiter = limiter(small_config());
        for _ in 0..3 {
            assert!(limiter.check("1.2.3.4", None, None, "GET /x").is_ok());
        }
        let err = limiter.check("1.2.3.4", None, None, "GET /x").unwrap_err();
        assert_eq!(err.scope, Scope::PerIp);
    }

    #[test]
    fn distinct_ips_have_independent_buckets() {
        let limiter = limiter(small_config());
        for _ in 0..3 {
            assert!(limiter.check("1.1.1.1", None, None, "GET /x").is_ok());
        }
        assert!(limiter.check("2.2.2.2", None, None, "GET /x").is_ok());
    }

    #[test]
    fn disabled_limiter_always_admits() {
        let mut config = small_config();
        config.enabled = false;
        let limiter = limiter(config);
        for _ in 0..10 {
            assert!(limiter.check("1.2.3.4", None, None, "GET /x").is_ok());
        }
    }

    #[test]
    fn role_multiplier_scales_per_user_limit() {
        let mut config = small_config();
        config.per_user = LimitWindow {
            limit: 2,
            horizon: Duration::from_secs(60),
        };
        config.role_multipliers.insert("tenant_admin".to_string(), 2.0);
        let limiter = limiter(config);

        for i in 0..4 {
            let ip = format!("10.0.0.{i}");
            let result = limiter.check(&ip, Some("user-1"), Some("tenant_admin"), "GET /x");
            assert!(result.is_ok(), "request {i} should be admitted under doubled limit");
        }
    }

    #[test]
    fn endpoint_override_applies_before_default() {
        let mut config = small_config();
        config.per_ip = LimitWindow {
            limit: 1000,
            horizon: Duration::from_secs(60),
        };
        config.per_endpoint_overrides.insert(
            "POST /api/v1/auth/token".to_string(),
            LimitWindow {
                limit: 1,
                horizon: Duration::from_secs(60),
            },
        );
        let limiter = limiter(config);
        assert!(limiter.check("1.2.3.4", None, None, "POST /api/v1/auth/token").is_ok());
        let err = limiter
            .check("1.2.3.4", None, None, "POST /api/v1/auth/token")
            .unwrap_err();
        assert_eq!(err.scope, Scope::PerEndpoint);
    }

    #[test]
    fn headers_cover_every_scope_checked() {
        let limiter = limiter(small_config());
        let results = limiter.check("1.2.3.4", Some("user-1"), None, "GET /x").unwrap();
        let headers = headers_for(&results);
        assert_eq!(headers.len(), results.len() * 3);
        assert!(headers.iter().any(|(k, _)| k == "X-RateLimit-Global-Limit"));
        assert!(headers.iter().any(|(k, _)| k == "X-RateLimit-User-Remaining"));
    }
}
