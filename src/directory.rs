//! User Directory: the account-storage collaborator referenced throughout
//! the Authentication Orchestrator (C5). Not a numbered component in its
//! own right; factored out because `login`/`register` both need it and
//! because the real deployment backs it with a relational table this crate
//! does not own.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::User;

/// Account storage and lookup, independent of authentication logic.
pub trait UserDirectory: Send + Sync {
    /// Look up a user by username or email, case-insensitively on email.
    fn lookup(&self, username_or_email: &str) -> Option<User>;

    /// Fetch the stored password hash for a user id.
    fn get_hash(&self, user_id: Uuid) -> Option<String>;

    /// Best-effort update of `last_login_at`. Failure is the caller's to
    /// tolerate; this trait signature reflects that by returning a plain
    /// bool rather than a typed error.
    fn update_last_login(&self, user_id: Uuid) -> bool;

    /// Create a new user. Fails if the (tenant, username) or (tenant,
    /// email) pair already exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] on a uniqueness conflict.
    fn create_user(
        &self,
        tenant_id: Uuid,
        username: &str,
        email: &str,
        password_hash: &str,
        role: &str,
    ) -> Result<User>;

    /// Fetch a user by id, regardless of tenant (the tenant boundary is
    /// enforced by `crate::model::Scoped` at the repository layer that
    /// wraps this trait in a multi-tenant deployment; this in-memory
    /// implementation is a single-process stand-in).
    fn get_by_id(&self, user_id: Uuid) -> Option<User>;
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<Uuid, User>,
    by_login: HashMap<String, Uuid>,
}

/// In-process [`UserDirectory`] backed by a `RwLock<HashMap>`. Stands in for
/// the relational user table in a full deployment.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    inner: RwLock<Inner>,
}

impl InMemoryUserDirectory {
    /// Construct an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn login_key(tenant_id: Uuid, login: &str) -> String {
        format!("{tenant_id}:{}", login.to_lowercase())
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn lookup(&self, username_or_email: &str) -> Option<User> {
        let guard = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let needle = username_or_email.to_lowercase();
        guard
            .by_id
            .values()
            .find(|u| u.username.to_lowercase() == needle || u.email.to_lowercase() == needle)
            .cloned()
    }

    fn get_hash(&self, user_id: Uuid) -> Option<String> {
        let guard = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.by_id.get(&user_id).map(|u| u.password_hash.clone())
    }

    fn update_last_login(&self, user_id: Uuid) -> bool {
        let mut guard = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(user) = guard.by_id.get_mut(&user_id) {
            user.last_login_at = Some(Utc::now());
            user.failed_login_count = 0;
            true
        } else {
            false
        }
    }

    fn create_user(
        &self,
        tenant_id: Uuid,
        username: &str,
        email: &str,
        password_hash: &str,
        role: &str,
    ) -> Result<User> {
        let mut guard = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);

        let username_key = Self::login_key(tenant_id, username);
        let email_key = Self::login_key(tenant_id, email);
        if guard.by_login.contains_key(&username_key) || guard.by_login.contains_key(&email_key) {
            return Err(Error::InvalidInput(
                "username or email already registered for this tenant".to_string(),
            ));
        }

        let user = User {
            id: Uuid::new_v4(),
            tenant_id,
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            role: role.to_string(),
            active: true,
            email_verified: false,
            mfa_enabled: false,
            failed_login_count: 0,
            lockout_until: None,
            last_login_at: None,
        };

        guard.by_login.insert(username_key, user.id);
        guard.by_login.insert(email_key, user.id);
        guard.by_id.insert(user.id, user.clone());

        Ok(user)
    }

    fn get_by_id(&self, user_id: Uuid) -> Option<User> {
        let guard = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.by_id.get(&user_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_lookup_by_email_is_case_insensitive() {
        let dir = InMemoryUserDirectory::new();
        let tenant = Uuid::new_v4();
        dir.create_user(tenant, "alice", "Alice@Example.com", "hash", "member").unwrap();
        assert!(dir.lookup("alice@example.com").is_some());
    }

    #[test]
    fn duplicate_email_is_rejected() {
        let dir = InMemoryUserDirectory::new();
        let tenant = Uuid::new_v4();
        dir.create_user(tenant, "alice", "alice@example.com", "hash", "member").unwrap();
        let err = dir.create_user(tenant, "alice2", "alice@example.com", "hash", "member").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn update_last_login_resets_failed_count() {
        let dir = InMemoryUserDirectory::new();
        let tenant = Uuid::new_v4();
        let user = dir.create_user(tenant, "alice", "alice@example.com", "hash", "member").unwrap();
        assert!(dir.update_last_login(user.id));
        assert!(dir.get_by_id(user.id).unwrap().last_login_at.is_some());
    }
}
