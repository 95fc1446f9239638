//! Core data model shared across components: tenants, users, roles,
//! provider credentials, and the `Scoped<T>` tenant-isolation wrapper.
//!
//! This replaces base-class "tenant-aware model" inheritance with
//! composition: every access to tenant-owned data goes through
//! [`Scoped<T>`], which forces the caller to present a tenant id before it
//! can get at the inner value.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// Normal operation.
    Active,
    /// Temporarily disabled by an administrator.
    Suspended,
    /// Deactivated; not destroyed.
    Inactive,
}

/// The top-level isolation boundary. Every user, credential, and session
/// belongs to exactly one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// Unique tenant id.
    pub id: Uuid,
    /// URL-safe unique slug.
    pub slug: String,
    /// Lifecycle state.
    pub status: TenantStatus,
    /// Subscription plan tag.
    pub plan: String,
    /// Maximum number of users this tenant may create.
    pub user_cap: u32,
}

/// A named permission set. System roles are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    /// Unique role name (e.g. `"tenant_admin"`).
    pub name: String,
    /// Human-readable label.
    pub label: String,
    /// Permission strings this role grants.
    pub permissions: Vec<String>,
    /// System roles cannot be edited or deleted by tenant admins.
    pub system: bool,
}

/// Permission list for one of the built-in system roles a [`User::role`]
/// reference resolves to. A tenant-defined custom role's permissions would
/// come from the Role Repository a full deployment backs this with; this
/// crate only seeds the fixed set every tenant starts with. Unknown role
/// names (a custom role not seeded anywhere this crate can see) resolve to
/// no permissions rather than panicking.
#[must_use]
pub fn system_role_permissions(role: &str) -> Vec<String> {
    match role {
        "owner" | "tenant_admin" => vec![
            "users:read".to_string(),
            "users:write".to_string(),
            "credentials:read".to_string(),
            "credentials:write".to_string(),
            "chat:read".to_string(),
            "chat:write".to_string(),
        ],
        "member" => vec![
            "credentials:read".to_string(),
            "chat:read".to_string(),
            "chat:write".to_string(),
        ],
        "readonly" => vec!["chat:read".to_string()],
        _ => Vec::new(),
    }
}

/// A user account, scoped to exactly one tenant.
///
/// The password is stored only as a salted adaptive-cost hash (see
/// [`crate::crypto::password`]); the plaintext never reaches this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Unique within (tenant, username).
    pub username: String,
    /// Unique within (tenant, email).
    pub email: String,
    /// Argon2 password hash (PHC string format).
    pub password_hash: String,
    /// Role name this user references.
    pub role: String,
    /// Account is usable for login.
    pub active: bool,
    /// Email ownership has been confirmed.
    pub email_verified: bool,
    /// MFA is enabled for this account. Factor-specific transports (TOTP,
    /// SMS, WebAuthn) are out of scope; this flag only records the state so
    /// claims and policy decisions can depend on it.
    pub mfa_enabled: bool,
    /// Consecutive failed login attempts since the last success.
    pub failed_login_count: u32,
    /// If set and in the future, login is locked out until this instant.
    pub lockout_until: Option<chrono::DateTime<chrono::Utc>>,
    /// Last successful login, best-effort.
    pub last_login_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl User {
    /// A redacted view safe to return to the caller after login/register.
    #[must_use]
    pub fn redacted(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            tenant_id: self.tenant_id,
            username: self.username.clone(),
            email: self.email.clone(),
            role: self.role.clone(),
            active: self.active,
            mfa_enabled: self.mfa_enabled,
        }
    }
}

/// Externally visible user profile; never carries the password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    /// Unique user id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Username.
    pub username: String,
    /// Email address.
    pub email: String,
    /// Role name.
    pub role: String,
    /// Account is usable for login.
    pub active: bool,
    /// MFA is enabled for this account.
    pub mfa_enabled: bool,
}

/// Third-party AI provider tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI.
    Openai,
    /// Anthropic.
    Anthropic,
    /// Google.
    Google,
    /// Deepseek.
    Deepseek,
    /// Azure OpenAI.
    Azure,
    /// Anything not covered by the enumerated tags.
    Custom,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Deepseek => "deepseek",
            Self::Azure => "azure",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// A tenant-owned, at-rest-encrypted provider API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCredential {
    /// Unique credential id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Provider tag.
    pub provider: Provider,
    /// Display name, unique within (tenant, provider).
    pub display_name: String,
    /// AES-256-GCM ciphertext: `nonce || ciphertext || tag`.
    pub encrypted_secret: Vec<u8>,
    /// Optional endpoint override (self-hosted / proxy deployments).
    pub endpoint: Option<String>,
    /// Free-form per-model configuration.
    pub model_configs: serde_json::Value,
    /// Whether this credential is eligible for selection.
    pub active: bool,
    /// Creation timestamp, used by `first_available`/`round_robin` ordering.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Last time this credential was handed out by the selector, used by
    /// `least_used` ordering.
    pub last_used_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A `T` that can only be produced by presenting the tenant it belongs to.
/// The primary safeguard against cross-tenant data leakage: there is no way
/// to construct one except through a repository call that already checked
/// the tenant id, and every downstream consumer receives the tenant id
/// alongside the value so it cannot be "forgotten" further down the chain.
#[derive(Debug, Clone)]
pub struct Scoped<T> {
    tenant_id: Uuid,
    value: T,
}

impl<T> Scoped<T> {
    /// Wrap `value` as belonging to `tenant_id`. Only repository code that
    /// has already verified tenant ownership should call this.
    #[must_use]
    pub fn new(tenant_id: Uuid, value: T) -> Self {
        Self { tenant_id, value }
    }

    /// The tenant this value is scoped to.
    #[must_use]
    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    /// Unwrap, but only if the caller presents the matching tenant id.
    /// Returns `None` on mismatch rather than panicking: a mismatch is
    /// expected caller behavior (probing another tenant's id), not a bug.
    #[must_use]
    pub fn into_inner_for(self, tenant_id: Uuid) -> Option<T> {
        if self.tenant_id == tenant_id {
            Some(self.value)
        } else {
            None
        }
    }

    /// Borrow the inner value, but only if the caller presents the matching
    /// tenant id.
    #[must_use]
    pub fn get_for(&self, tenant_id: Uuid) -> Option<&T> {
        if self.tenant_id == tenant_id {
            Some(&self.value)
        } else {
            None
        }
    }
}

/// Token kind, carried in claims and checked by `verify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Short-lived credential presented on every authenticated request.
    Access,
    /// Longer-lived credential exchanged for a new access/refresh pair.
    Refresh,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access => f.write_str("access"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// A minted access/refresh pair, as returned to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    /// Signed access token.
    pub access_token: String,
    /// Signed refresh token.
    pub refresh_token: String,
    /// Access-token lifetime in seconds, for client-side renewal scheduling.
    pub expires_in: i64,
    /// Always `"bearer"`.
    pub token_type: &'static str,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Normal, usable session.
    Active,
    /// Passed its hard expiry or idle timeout.
    Expired,
    /// Explicitly ended (logout, eviction, admin action).
    Terminated,
    /// Flagged by hijack-detection heuristics; tokens have been revoked.
    Suspicious,
}

/// A parsed, coarse device fingerprint derived from `User-Agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    /// `mobile`, `tablet`, or `desktop`.
    pub device_type: String,
    /// Coarse OS family, e.g. `"Windows"`, `"Android"`, `"unknown"`.
    pub os_family: String,
    /// Coarse browser family, e.g. `"Chrome"`, `"Safari"`, `"unknown"`.
    pub browser_family: String,
    /// Raw user-agent string, kept for Jaccard comparison on revalidation.
    pub raw_user_agent: String,
}

/// A server-side session record, independent of any single token's
/// lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Stable session id.
    pub id: String,
    /// Owning user.
    pub user_id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Client IP observed at `open`.
    pub ip_at_open: String,
    /// Most recently observed client IP.
    pub last_ip: String,
    /// Parsed device fingerprint at `open`.
    pub device: DeviceFingerprint,
    /// Open timestamp.
    pub opened_at: chrono::DateTime<chrono::Utc>,
    /// Last-activity timestamp.
    pub last_activity_at: chrono::DateTime<chrono::Utc>,
    /// Hard expiry; the session is unusable past this instant regardless of
    /// activity.
    pub expires_at: chrono::DateTime<chrono::Utc>,
    /// Lifecycle state.
    pub state: SessionState,
    /// jti of the currently bound access token.
    pub access_jti: String,
    /// jti of the currently bound refresh token.
    pub refresh_jti: String,
    /// Set once hijack-detection heuristics fire.
    pub suspicious: bool,
    /// Bounded recent-activity log (most-recent 100 entries, 7-day TTL
    /// enforced by the registry, not encoded in this struct).
    pub recent_activity: Vec<String>,
    /// Count of distinct IPs observed for this session within the trailing
    /// hour, used by the hijack heuristic.
    pub ip_changes_last_hour: u32,
}

/// Ambient per-request context, created at ingress and propagated
/// end-to-end. Downstream services see the authenticated half of this via
/// injected headers, never via a client-supplied one.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request id: client-supplied `X-Request-Id` or minted as
    /// `req-<ts>-<rand>`.
    pub request_id: String,
    /// Populated once the gateway has verified a bearer token.
    pub principal: Option<Principal>,
    /// Origin IP, best-effort (`X-Forwarded-For` first hop or peer addr).
    pub origin_ip: String,
    /// Raw `User-Agent` header value, if present.
    pub user_agent: Option<String>,
}

/// The authenticated caller, attached to a [`RequestContext`] after a
/// successful token verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// User id.
    pub user_id: Uuid,
    /// Tenant id.
    pub tenant_id: Uuid,
    /// Role name.
    pub role: String,
    /// Email address.
    pub email: String,
    /// Flattened permission list from the user's role.
    pub permissions: Vec<String>,
}
