//! C5: Authentication Orchestrator. Composes the Rate Limiter, User
//! Directory, Token Service, Session Registry, and Policy Engine into the
//! four public operations a client actually calls: login, refresh, logout,
//! register.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::{AuthConfig, IpPolicyConfig, PasswordPolicyConfig};
use crate::crypto::password::{hash_password, verify_password};
use crate::directory::UserDirectory;
use crate::error::{Error, Result};
use crate::model::{TokenKind, TokenPair, UserProfile};
use crate::policy::PolicyEngine;
use crate::ratelimit::RateLimiter;
use crate::session::SessionRegistry;
use crate::token::{TokenService, UserSnapshot};

/// Scope key used for the per-(login, ip) rate-limit bucket, distinct from
/// the gateway's own per-ip scope so a brute-force attempt against login
/// doesn't share a budget with ordinary traffic from the same IP.
const LOGIN_ENDPOINT_KEY: &str = "POST /api/v1/auth/token";

fn record_login_failure() {
    telemetry_metrics::counter!("login_failures_total").increment(1);
}

/// Successful login result.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// The minted access/refresh pair.
    pub tokens: TokenPair,
    /// Redacted user profile.
    pub user: UserProfile,
    /// The session opened for this login.
    pub session_id: String,
}

/// Composes the Rate Limiter, User Directory, Token Service, Session
/// Registry, and Policy Engine.
pub struct AuthOrchestrator {
    auth_config: AuthConfig,
    directory: Arc<dyn UserDirectory>,
    tokens: Arc<TokenService>,
    sessions: Arc<SessionRegistry>,
    rate_limiter: Arc<RateLimiter>,
    policy: Arc<PolicyEngine>,
    password_policy: PasswordPolicyConfig,
    ip_policy: IpPolicyConfig,
}

impl AuthOrchestrator {
    /// Build an orchestrator from its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth_config: AuthConfig,
        directory: Arc<dyn UserDirectory>,
        tokens: Arc<TokenService>,
        sessions: Arc<SessionRegistry>,
        rate_limiter: Arc<RateLimiter>,
        policy: Arc<PolicyEngine>,
        password_policy: PasswordPolicyConfig,
        ip_policy: IpPolicyConfig,
    ) -> Self {
        Self {
            auth_config,
            directory,
            tokens,
            sessions,
            rate_limiter,
            policy,
            password_policy,
            ip_policy,
        }
    }

    /// Authenticate a username/email + password pair, mint a token pair,
    /// and open a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] if the (login, ip) bucket is
    /// exhausted; [`Error::InvalidCredentials`] for unknown user or wrong
    /// password (deliberately indistinguishable); [`Error::AccountDisabled`]
    /// for an inactive account.
    #[tracing::instrument(skip(self, plaintext_password), fields(%username))]
    pub fn login(&self, username: &str, plaintext_password: &str, ip: &str, user_agent: &str) -> Result<LoginOutcome> {
        if let Err(denial) = self.rate_limiter.check(ip, None, None, LOGIN_ENDPOINT_KEY) {
            record_login_failure();
            return Err(Error::RateLimited {
                scope: denial.scope.as_str().to_string(),
                retry_after_secs: denial.retry_after_secs,
            });
        }

        if !self.policy.check_ip(ip, &self.ip_policy).is_admitted() {
            record_login_failure();
            return Err(Error::Forbidden("origin ip is not permitted".to_string()));
        }

        let Some(user) = self.directory.lookup(username) else {
            self.policy.record_failed_login(ip, &self.ip_policy);
            record_login_failure();
            return Err(Error::InvalidCredentials);
        };

        if !user.active {
            record_login_failure();
            return Err(Error::AccountDisabled);
        }

        let Some(stored_hash) = self.directory.get_hash(user.id) else {
            self.policy.record_failed_login(ip, &self.ip_policy);
            record_login_failure();
            return Err(Error::InvalidCredentials);
        };

        if !verify_password(plaintext_password, &stored_hash) {
            self.policy.record_failed_login(ip, &self.ip_policy);
            record_login_failure();
            return Err(Error::InvalidCredentials);
        }

        let snapshot = UserSnapshot::from(&user);
        let (access_token, access_jti, access_exp) =
            self.tokens.mint(&snapshot, TokenKind::Access, self.auth_config.access_token_ttl)?;
        let (refresh_token, refresh_jti, _refresh_exp) =
            self.tokens.mint(&snapshot, TokenKind::Refresh, self.auth_config.refresh_token_ttl)?;

        let session = self
            .sessions
            .open(user.id, user.tenant_id, ip, user_agent, access_jti, refresh_jti);

        if !self.directory.update_last_login(user.id) {
            tracing::warn!(user_id = %user.id, "failed to update last_login_at, continuing");
        }

        telemetry_metrics::counter!("login_successes_total").increment(1);
        Ok(LoginOutcome {
            tokens: TokenPair {
                access_token,
                refresh_token,
                expires_in: access_exp - chrono::Utc::now().timestamp(),
                token_type: "bearer",
            },
            user: user.redacted(),
            session_id: session.id,
        })
    }

    /// Exchange a refresh token for a new access/refresh pair. Single-use:
    /// the old refresh token is revoked before the new pair is minted, so a
    /// concurrent second call against the same token fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh token fails verification or if the
    /// referenced user no longer exists.
    #[tracing::instrument(skip(self, refresh_token))]
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self
            .tokens
            .verify(refresh_token, TokenKind::Refresh)
            .map_err(|e| Error::Unauthenticated(e.to_string()))?;

        // Atomic single-use gate: insert-if-absent into the blacklist, and
        // proceed to mint a new pair only if this call performed that
        // insert. Two concurrent calls against the same refresh token both
        // pass `verify` (neither has blacklisted it yet), but
        // `revoke_jti_if_absent` is a single insert-if-absent against the
        // store's per-key critical section, so exactly one of them wins the
        // race; the loser is rejected here rather than minting a second
        // live pair from the same token.
        if !self.tokens.revoke_jti_if_absent(&claims.jti, claims.exp, "refresh rotation") {
            return Err(Error::Unauthenticated("refresh token already used".to_string()));
        }

        let Some(user) = self.directory.get_by_id(claims.sub) else {
            return Err(Error::InvalidCredentials);
        };
        if !user.active {
            return Err(Error::AccountDisabled);
        }

        let snapshot = UserSnapshot::from(&user);
        let (access_token, _access_jti, access_exp) =
            self.tokens.mint(&snapshot, TokenKind::Access, self.auth_config.access_token_ttl)?;
        let (new_refresh_token, _refresh_jti, _refresh_exp) =
            self.tokens.mint(&snapshot, TokenKind::Refresh, self.auth_config.refresh_token_ttl)?;

        Ok(TokenPair {
            access_token,
            refresh_token: new_refresh_token,
            expires_in: access_exp - chrono::Utc::now().timestamp(),
            token_type: "bearer",
        })
    }

    /// Revoke a token, if present. Absence of a token is not an error: the
    /// client's intent to end its session is honored regardless.
    #[tracing::instrument(skip(self, token))]
    pub fn logout(&self, token: Option<&str>) {
        let Some(token) = token else {
            return;
        };
        if !self.tokens.revoke(token, "logout") {
            tracing::debug!("logout presented an already-invalid token; nothing to revoke");
        }
    }

    /// Register a new account. Validates the password against the Policy
    /// Engine before hashing; does not auto-login, matching the boundary
    /// between account creation and session establishment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the password fails policy, or
    /// propagates a directory uniqueness conflict.
    #[tracing::instrument(skip(self, plaintext_password), fields(%username, %email))]
    pub fn register(
        &self,
        tenant_id: Uuid,
        username: &str,
        email: &str,
        plaintext_password: &str,
    ) -> Result<UserProfile> {
        let assessment = crate::policy::assess_password(plaintext_password, &self.password_policy, &[username, email]);
        if !assessment.valid {
            return Err(Error::InvalidInput(assessment.errors.join("; ")));
        }

        let hash = hash_password(plaintext_password)?;
        let user = self.directory.create_user(tenant_id, username, email, &hash, "member")?;
        Ok(user.redacted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitConfig, SessionConfig};
    use crate::directory::InMemoryUserDirectory;
    use crate::store::InMemoryStore;

    fn orchestrator() -> (AuthOrchestrator, Arc<InMemoryUserDirectory>) {
        let store: Arc<dyn crate::store::KeyValueStore> = Arc::new(InMemoryStore::new());
        let auth_config = AuthConfig {
            secret_key: "x".repeat(32),
            ..Default::default()
        };
        let tokens = Arc::new(TokenService::new(&auth_config, store.clone()).unwrap());
        let sessions = Arc::new(SessionRegistry::new(SessionConfig::default(), tokens.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), store.clone()));
        let policy = Arc::new(PolicyEngine::new(store));
        let directory = Arc::new(InMemoryUserDirectory::new());

        let orchestrator = AuthOrchestrator::new(
            auth_config,
            directory.clone(),
            tokens,
            sessions,
            rate_limiter,
            policy,
            PasswordPolicyConfig::default(),
            IpPolicyConfig::default(),
        );
        (orchestrator, directory)
    }

    fn seed_user(directory: &InMemoryUserDirectory, tenant: Uuid, password: &str) -> Uuid {
        let hash = hash_password(password).unwrap();
        directory.create_user(tenant, "alice", "alice@x.io", &hash, "member").unwrap().id
    }

    #[test]
    fn login_succeeds_with_correct_password() {
        let (orchestrator, directory) = orchestrator();
        let tenant = Uuid::new_v4();
        seed_user(&directory, tenant, "Correct123!");

        let outcome = orchestrator.login("alice@x.io", "Correct123!", "1.2.3.4", "test-agent").unwrap();
        assert_eq!(outcome.user.email, "alice@x.io");
        assert!(!outcome.tokens.access_token.is_empty());
    }

    #[test]
    fn login_fails_with_wrong_password() {
        let (orchestrator, directory) = orchestrator();
        let tenant = Uuid::new_v4();
        seed_user(&directory, tenant, "Correct123!");

        let err = orchestrator.login("alice@x.io", "wrong", "1.2.3.4", "test-agent").unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[test]
    fn login_unknown_user_is_invalid_credentials_not_not_found() {
        let (orchestrator, _directory) = orchestrator();
        let err = orchestrator.login("nobody@x.io", "whatever", "1.2.3.4", "test-agent").unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[test]
    fn refresh_rotation_invalidates_old_token() {
        let (orchestrator, directory) = orchestrator();
        let tenant = Uuid::new_v4();
        seed_user(&directory, tenant, "Correct123!");
        let outcome = orchestrator.login("alice@x.io", "Correct123!", "1.2.3.4", "test-agent").unwrap();

        let new_pair = orchestrator.refresh(&outcome.tokens.refresh_token).unwrap();
        assert_ne!(new_pair.refresh_token, outcome.tokens.refresh_token);

        let err = orchestrator.refresh(&outcome.tokens.refresh_token).unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[test]
    fn register_rejects_weak_password() {
        let (orchestrator, _directory) = orchestrator();
        let err = orchestrator
            .register(Uuid::new_v4(), "bob", "bob@x.io", "weak")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn register_does_not_auto_login() {
        let (orchestrator, directory) = orchestrator();
        let tenant = Uuid::new_v4();
        let profile = orchestrator
            .register(tenant, "bob", "bob@x.io", "Correct123!Z")
            .unwrap();
        assert_eq!(profile.email, "bob@x.io");
        assert!(directory.lookup("bob@x.io").unwrap().last_login_at.is_none());
    }

    #[test]
    fn logout_without_token_is_not_an_error() {
        let (orchestrator, _directory) = orchestrator();
        orchestrator.logout(None);
    }

    #[test]
    fn eleventh_failed_login_from_same_ip_is_rate_limited() {
        let (orchestrator, directory) = orchestrator();
        let tenant = Uuid::new_v4();
        seed_user(&directory, tenant, "Correct123!");

        for _ in 0..10 {
            let _ = orchestrator.login("alice@x.io", "wrong", "9.9.9.9", "test-agent");
        }
        let err = orchestrator.login("alice@x.io", "wrong", "9.9.9.9", "test-agent").unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
    }
}
