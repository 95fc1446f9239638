//! Configuration management.
//!
//! Layered via `figment`: built-in defaults, an optional YAML file, then
//! `GATEWAY__`-prefixed environment variables (double underscore splits
//! nested keys), with CLI overrides applied last by the caller. `${VAR}` and
//! `${VAR:-default}` patterns are expanded against the process environment
//! after `.env` files (if configured) are loaded, so secret-bearing fields
//! never need to be hand-expanded by the operator.

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// `.env` files to load before environment-variable expansion. Supports
    /// `~` expansion; later files override earlier ones; missing files are
    /// skipped (logged at debug, not an error).
    #[serde(default)]
    pub env_files: Vec<String>,
    /// HTTP server bind/timeout settings.
    pub server: ServerConfig,
    /// Token-service signing configuration.
    pub auth: AuthConfig,
    /// Sliding-window rate-limit configuration.
    pub rate_limit: RateLimitConfig,
    /// Session registry policy.
    pub session: SessionConfig,
    /// Secret-store master-key configuration.
    pub secrets: SecretStoreConfig,
    /// Password and IP admission policy defaults.
    pub policy: PolicyConfig,
    /// Downstream route table, keyed by path prefix.
    pub routes: HashMap<String, RouteConfig>,
    /// CORS configuration.
    pub cors: CorsConfig,
}

impl Config {
    /// Load configuration from an optional YAML file plus environment
    /// overrides, then validate required fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read/parsed, if figment
    /// extraction fails, or if [`Config::validate`] rejects the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Internal(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("GATEWAY__").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Internal(format!("config error: {e}")))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if let Some(rest) = path_str.strip_prefix('~') {
                dirs::home_dir().map_or_else(|| path_str.clone(), |home| format!("{}{rest}", home.display()))
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!(path = %expanded, "loaded env file"),
                    Err(error) => tracing::warn!(path = %expanded, %error, "failed to load env file"),
                }
            } else {
                tracing::debug!(path = %expanded, "env file not found, skipped");
            }
        }
    }

    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static regex");
        self.auth.secret_key = Self::expand_string(&re, &self.auth.secret_key);
        self.auth.private_key_pem = self.auth.private_key_pem.as_deref().map(|v| Self::expand_string(&re, v));
        self.auth.public_key_pem = self.auth.public_key_pem.as_deref().map(|v| Self::expand_string(&re, v));
        self.secrets.master_key = Self::expand_string(&re, &self.secrets.master_key);
        for route in self.routes.values_mut() {
            route.target_base_url = Self::expand_string(&re, &route.target_base_url);
        }
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures<'_>| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Validate required fields; called once at load time. Numeric policy
    /// bounds (§4.8) are re-checked at policy-update time separately.
    ///
    /// # Errors
    ///
    /// Returns an error describing every violated invariant, fail-fast.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.auth.secret_key.len() < 32 {
            errors.push("auth.secret_key must be at least 32 bytes".to_string());
        }
        if self.secrets.master_key.len() < 32 {
            errors.push("secrets.master_key must be at least 32 bytes".to_string());
        }
        if self.auth.algorithm == SigningAlgorithm::Rs256
            && (self.auth.private_key_pem.is_none() || self.auth.public_key_pem.is_none())
        {
            errors.push(
                "auth.algorithm=rs256 requires auth.private_key_pem and auth.public_key_pem; \
                 this gateway never falls back to an ephemeral generated keypair"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "invalid configuration: {}",
                errors.join("; ")
            )))
        }
    }
}

/// HTTP server bind/timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Per-downstream-call deadline.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful-shutdown drain timeout.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum inbound request body size, bytes.
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// Signature algorithm for minted tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningAlgorithm {
    /// HMAC-SHA256, symmetric.
    Hs256,
    /// RSA-SHA256, asymmetric.
    Rs256,
}

/// Token-service signing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Symmetric signing key (HS256). Must be >= 32 bytes.
    pub secret_key: String,
    /// Which signature algorithm to mint/verify with.
    pub algorithm: SigningAlgorithm,
    /// PEM-encoded RSA private key, required when `algorithm = rs256`.
    #[serde(default)]
    pub private_key_pem: Option<String>,
    /// PEM-encoded RSA public key, required when `algorithm = rs256`.
    #[serde(default)]
    pub public_key_pem: Option<String>,
    /// Token issuer claim.
    pub issuer: String,
    /// Token audience claim.
    pub audience: String,
    /// Access-token lifetime.
    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,
    /// Refresh-token lifetime.
    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            algorithm: SigningAlgorithm::Hs256,
            private_key_pem: None,
            public_key_pem: None,
            issuer: "gateway".to_string(),
            audience: "gateway-clients".to_string(),
            access_token_ttl: Duration::from_secs(30 * 60),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Per-scope sliding-window limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitWindow {
    /// Maximum admitted requests within the horizon.
    pub limit: u32,
    /// Sliding-window horizon.
    #[serde(with = "humantime_serde")]
    pub horizon: Duration,
}

/// Sliding-window rate-limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Master enable/disable switch.
    pub enabled: bool,
    /// Whether the five-step admission procedure must be atomic per key.
    /// The in-process store already provides this for free; the flag
    /// documents the choice for operators who later swap in a remote store.
    pub strict_atomic: bool,
    /// Global scope limit, applied to every request.
    pub global: LimitWindow,
    /// Per-IP scope limit.
    pub per_ip: LimitWindow,
    /// Per-authenticated-user scope limit.
    pub per_user: LimitWindow,
    /// Default per-endpoint scope limit.
    pub per_endpoint_default: LimitWindow,
    /// Per-endpoint overrides, keyed by `METHOD path`.
    #[serde(default)]
    pub per_endpoint_overrides: HashMap<String, LimitWindow>,
    /// Per-role limit multiplier (e.g. `tenant_admin` -> 2.0).
    #[serde(default)]
    pub role_multipliers: HashMap<String, f64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut overrides = HashMap::new();
        overrides.insert(
            "POST /api/v1/auth/token".to_string(),
            LimitWindow {
                limit: 10,
                horizon: Duration::from_secs(60),
            },
        );
        overrides.insert(
            "POST /api/v1/auth/register".to_string(),
            LimitWindow {
                limit: 5,
                horizon: Duration::from_secs(60),
            },
        );
        overrides.insert(
            "GET /health".to_string(),
            LimitWindow {
                limit: 1000,
                horizon: Duration::from_secs(60),
            },
        );

        let mut role_multipliers = HashMap::new();
        role_multipliers.insert("tenant_admin".to_string(), 2.0);
        role_multipliers.insert("super_admin".to_string(), 5.0);

        Self {
            enabled: true,
            strict_atomic: true,
            global: LimitWindow {
                limit: 10_000,
                horizon: Duration::from_secs(60),
            },
            per_ip: LimitWindow {
                limit: 300,
                horizon: Duration::from_secs(60),
            },
            per_user: LimitWindow {
                limit: 600,
                horizon: Duration::from_secs(60),
            },
            per_endpoint_default: LimitWindow {
                limit: 120,
                horizon: Duration::from_secs(60),
            },
            per_endpoint_overrides: overrides,
            role_multipliers,
        }
    }
}

/// Session registry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum concurrent active sessions per user.
    pub max_concurrent: u32,
    /// Single-sign-on mode: opening a session terminates all others.
    pub single_sign_on: bool,
    /// Hard session lifetime from open.
    #[serde(with = "humantime_serde")]
    pub hard_expiry: Duration,
    /// Idle timeout since last activity.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Jaccard similarity threshold below which a user-agent change counts
    /// as a device mismatch.
    pub ua_similarity_threshold: f64,
    /// IP changes within one hour before a session is flagged suspicious.
    pub max_ip_changes_per_hour: u32,
    /// Interval between cleanup sweeps.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            single_sign_on: false,
            hard_expiry: Duration::from_secs(7 * 24 * 60 * 60),
            idle_timeout: Duration::from_secs(60 * 60),
            ua_similarity_threshold: 0.8,
            max_ip_changes_per_hour: 3,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Secret-store master-key configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretStoreConfig {
    /// AES-256-GCM master key. Must be >= 32 bytes; only the first 32 are
    /// used as key material.
    pub master_key: String,
}

impl Default for SecretStoreConfig {
    fn default() -> Self {
        Self {
            master_key: String::new(),
        }
    }
}

/// Password and IP admission policy defaults (overridable at runtime via the
/// policy document; see `crate::policy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Password policy.
    pub password: PasswordPolicyConfig,
    /// IP admission policy.
    pub ip: IpPolicyConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            password: PasswordPolicyConfig::default(),
            ip: IpPolicyConfig::default(),
        }
    }
}

/// Raw, serde-friendly password policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicyConfig {
    /// Minimum accepted length.
    pub min_length: usize,
    /// Maximum accepted length.
    pub max_length: usize,
    /// Require at least one uppercase letter.
    pub require_uppercase: bool,
    /// Require at least one lowercase letter.
    pub require_lowercase: bool,
    /// Require at least one digit.
    pub require_digits: bool,
    /// Require at least one special character.
    pub require_special_chars: bool,
    /// Accepted special-character set.
    pub special_chars: String,
    /// Reject passwords containing a common weak password as a substring.
    pub prevent_common_passwords: bool,
    /// Reject passwords containing user-info fields (email local-part,
    /// username) as a substring, case-insensitively.
    pub prevent_user_info_in_password: bool,
}

impl Default for PasswordPolicyConfig {
    fn default() -> Self {
        Self {
            min_length: 8,
            max_length: 128,
            require_uppercase: true,
            require_lowercase: true,
            require_digits: true,
            require_special_chars: true,
            special_chars: "!@#$%^&*()_+-=[]{}|;:,.<>?".to_string(),
            prevent_common_passwords: true,
            prevent_user_info_in_password: true,
        }
    }
}

/// Raw, serde-friendly IP admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpPolicyConfig {
    /// Enable deny-list enforcement.
    pub blacklist_enabled: bool,
    /// CIDR ranges always denied.
    pub blocked_ip_ranges: Vec<String>,
    /// Enable allow-list enforcement (exclusive when non-empty).
    pub whitelist_enabled: bool,
    /// CIDR ranges always allowed; when enabled and non-empty, only matches
    /// are admitted.
    pub allowed_ip_ranges: Vec<String>,
    /// Automatically ban an IP after repeated failed logins.
    pub auto_block_suspicious_ips: bool,
    /// Failed-login count within the 1-hour window that triggers a ban.
    pub auto_block_threshold: u32,
    /// Duration of an automatic ban.
    pub block_duration_hours: u64,
}

impl Default for IpPolicyConfig {
    fn default() -> Self {
        Self {
            blacklist_enabled: false,
            blocked_ip_ranges: Vec::new(),
            whitelist_enabled: false,
            allowed_ip_ranges: Vec::new(),
            auto_block_suspicious_ips: true,
            auto_block_threshold: 10,
            block_duration_hours: 1,
        }
    }
}

/// A single downstream route table entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Base URL of the downstream service (scheme + host + optional port).
    pub target_base_url: String,
    /// Whether a valid bearer token is required on this prefix.
    pub require_auth: bool,
    /// Human-readable tag used in logs/metrics.
    pub service_tag: String,
    /// Per-route downstream call deadline; falls back to
    /// `server.request_timeout` when unset.
    #[serde(default, with = "option_humantime_serde")]
    pub timeout: Option<Duration>,
}

/// CORS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins. `["*"]` allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
        }
    }
}

/// `Duration` as a human-readable string (e.g. `"30s"`, `"5m"`, `"100ms"`).
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize a `Duration` as seconds-suffixed text.
    ///
    /// # Errors
    ///
    /// Propagates any error from the underlying serializer.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize `"30s"`, `"5m"`, `"100ms"`, or a bare integer (seconds).
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string has an unknown suffix
    /// or the numeric part does not parse.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(s: &str) -> std::result::Result<Duration, String> {
        if let Some(secs) = s.strip_suffix("ms") {
            return secs
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string());
        }
        if let Some(secs) = s.strip_suffix('s') {
            return secs
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string());
        }
        if let Some(mins) = s.strip_suffix('m') {
            return mins
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| e.to_string());
        }
        if let Some(hrs) = s.strip_suffix('h') {
            return hrs
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|e| e.to_string());
        }
        s.parse::<u64>().map(Duration::from_secs).map_err(|e| e.to_string())
    }
}

/// `Option<Duration>` variant of [`humantime_serde`], used for optional
/// per-route overrides.
pub mod option_humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize `Some(duration)` the same way as [`super::humantime_serde`];
    /// `None` serializes as `null`.
    ///
    /// # Errors
    ///
    /// Propagates any error from the underlying serializer.
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&format!("{}s", d.as_secs())),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional humantime-style duration string.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string has an unknown suffix.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        opt.map(|s| super::humantime_serde::parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_short_secret_key() {
        let config = Config {
            auth: AuthConfig {
                secret_key: "too-short".to_string(),
                ..Default::default()
            },
            secrets: SecretStoreConfig {
                master_key: "x".repeat(32),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_rs256_without_keys() {
        let config = Config {
            auth: AuthConfig {
                secret_key: "x".repeat(32),
                algorithm: SigningAlgorithm::Rs256,
                ..Default::default()
            },
            secrets: SecretStoreConfig {
                master_key: "x".repeat(32),
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rs256"));
    }

    #[test]
    fn accepts_valid_hs256_config() {
        let config = Config {
            auth: AuthConfig {
                secret_key: "x".repeat(32),
                ..Default::default()
            },
            secrets: SecretStoreConfig {
                master_key: "x".repeat(32),
            },
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn expands_route_target_default_value() {
        // `env::set_var` is unsafe in edition 2024 and this crate forbids
        // unsafe code, so this exercises the `${VAR:-default}` branch rather
        // than mutating the process environment from a test.
        let mut config = Config::default();
        config.routes.insert(
            "/api/v1/chat".to_string(),
            RouteConfig {
                target_base_url: "${GATEWAY_TEST_TARGET_HOST_UNSET:-https://svc.internal}".to_string(),
                require_auth: true,
                service_tag: "chat".to_string(),
                timeout: None,
            },
        );
        config.expand_env_vars();
        assert_eq!(
            config.routes["/api/v1/chat"].target_base_url,
            "https://svc.internal"
        );
    }

    #[test]
    fn env_files_skip_missing_silently() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn env_files_load_into_process_env() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "GATEWAY_TEST_FILE_VAR=from_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();
        assert_eq!(env::var("GATEWAY_TEST_FILE_VAR").unwrap(), "from_file");
    }

    #[test]
    fn humantime_roundtrip() {
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("2h").unwrap(), Duration::from_secs(7200));
    }
}
