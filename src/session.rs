//! C4: Session Registry. Tracks server-side session state independent of
//! any single token's lifetime, indexed by user id, with device-fingerprint
//! and IP-hijack heuristics layered on top of the bound access/refresh jtis.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::model::{DeviceFingerprint, Session, SessionState};
use crate::token::TokenService;

const RECENT_ACTIVITY_CAP: usize = 100;
const RECENT_ACTIVITY_TTL_DAYS: i64 = 7;

/// Parse a coarse device fingerprint from a raw `User-Agent` header value.
/// Matches by substring, not a full UA-database lookup.
#[must_use]
pub fn parse_device_fingerprint(user_agent: &str) -> DeviceFingerprint {
    let device_type = if user_agent.contains("iPad") || user_agent.contains("Tablet") {
        "tablet"
    } else if user_agent.contains("Mobile") || user_agent.contains("iPhone") || user_agent.contains("Android") {
        "mobile"
    } else {
        "desktop"
    };

    let os_family = if user_agent.contains("Windows") {
        "Windows"
    } else if user_agent.contains("Mac OS X") {
        "Mac OS X"
    } else if user_agent.contains("Android") {
        "Android"
    } else if user_agent.contains("iOS") || user_agent.contains("iPhone") || user_agent.contains("iPad") {
        "iOS"
    } else if user_agent.contains("Linux") {
        "Linux"
    } else {
        "unknown"
    };

    // Edge and Chrome are checked before Safari: both carry a "Safari" token
    // in their UA string for legacy-compatibility reasons.
    let browser_family = if user_agent.contains("Edg") {
        "Edge"
    } else if user_agent.contains("Chrome") {
        "Chrome"
    } else if user_agent.contains("Firefox") {
        "Firefox"
    } else if user_agent.contains("Safari") {
        "Safari"
    } else {
        "unknown"
    };

    DeviceFingerprint {
        device_type: device_type.to_string(),
        os_family: os_family.to_string(),
        browser_family: browser_family.to_string(),
        raw_user_agent: user_agent.to_string(),
    }
}

/// Jaccard similarity over tokenized, lowercased user-agent word sets. Two
/// empty sets are vacuously identical (similarity 1.0), avoiding a
/// divide-by-zero for blank user-agents.
#[must_use]
pub fn ua_similarity(a: &str, b: &str) -> f64 {
    let tokenize = |s: &str| -> HashSet<String> {
        s.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect()
    };
    let set_a = tokenize(a);
    let set_b = tokenize(b);

    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        1.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        {
            intersection as f64 / union as f64
        }
    }
}

/// Outcome of [`SessionRegistry::validate`].
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Whether the session remains usable.
    pub valid: bool,
    /// Human-readable issues found (ip change, ua mismatch, expired, etc.);
    /// empty when `valid` is true and nothing was noteworthy.
    pub issues: Vec<String>,
    /// The session as it stands after validation (state may have changed).
    pub session: Session,
}

struct UserIndex {
    sessions_by_id: HashMap<String, Session>,
    ids_by_user: HashMap<Uuid, Vec<String>>,
    ip_change_log: HashMap<String, Vec<DateTime<Utc>>>,
}

/// Tracks sessions keyed by id, indexed by user id, with bound access/refresh
/// jtis revoked through the Token Service whenever a session leaves the
/// active state.
pub struct SessionRegistry {
    config: SessionConfig,
    tokens: Arc<TokenService>,
    inner: Mutex<UserIndex>,
}

impl SessionRegistry {
    /// Build a registry bound to a token service for jti revocation.
    #[must_use]
    pub fn new(config: SessionConfig, tokens: Arc<TokenService>) -> Self {
        Self {
            config,
            tokens,
            inner: Mutex::new(UserIndex {
                sessions_by_id: HashMap::new(),
                ids_by_user: HashMap::new(),
                ip_change_log: HashMap::new(),
            }),
        }
    }

    /// Open a new session for `user_id`, enforcing the configured
    /// concurrency cap (oldest-first eviction) or, under single-sign-on
    /// mode, terminating every other session for the user first.
    #[tracing::instrument(skip(self, access_jti, refresh_jti), fields(%user_id))]
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        ip: &str,
        user_agent: &str,
        access_jti: String,
        refresh_jti: String,
    ) -> Session {
        let device = parse_device_fingerprint(user_agent);
        let now = Utc::now();

        let mut guard = self.inner.lock();

        if self.config.single_sign_on {
            self.terminate_all_locked(&mut guard, user_id, None, "single sign-on: new session opened");
        } else {
            let existing = guard.ids_by_user.entry(user_id).or_default().clone();
            if existing.len() >= self.config.max_concurrent as usize {
                if let Some(oldest_id) = existing
                    .iter()
                    .filter_map(|id| guard.sessions_by_id.get(id).map(|s| (id.clone(), s.opened_at)))
                    .min_by_key(|(_, opened_at)| *opened_at)
                    .map(|(id, _)| id)
                {
                    self.terminate_locked(&mut guard, &oldest_id, "concurrent session limit");
                }
            }
        }

        // An unrecognized (user, ip) pair is the first observation for this
        // user; treated as suspicious only if the user already has history
        // elsewhere (a brand-new account's first session is never flagged).
        let has_history = guard.ids_by_user.get(&user_id).is_some_and(|ids| !ids.is_empty());
        let known_ip = guard
            .ids_by_user
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| guard.sessions_by_id.get(id))
            .any(|s| s.ip_at_open == ip || s.last_ip == ip);
        let suspicious = has_history && !known_ip;

        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id,
            tenant_id,
            ip_at_open: ip.to_string(),
            last_ip: ip.to_string(),
            device,
            opened_at: now,
            last_activity_at: now,
            expires_at: now + ChronoDuration::from_std(self.config.hard_expiry).unwrap_or(ChronoDuration::zero()),
            state: SessionState::Active,
            access_jti,
            refresh_jti,
            suspicious,
            recent_activity: Vec::new(),
            ip_changes_last_hour: 0,
        };

        guard.sessions_by_id.insert(session.id.clone(), session.clone());
        guard.ids_by_user.entry(user_id).or_default().push(session.id.clone());

        telemetry_metrics::gauge!("active_sessions").increment(1.0);
        session
    }

    /// Refresh `last_activity_at`, rejecting (and marking expired) a session
    /// past its hard expiry or idle timeout. Appends `activity` to the
    /// bounded recent-activity log when present.
    #[tracing::instrument(skip(self, activity))]
    pub fn touch(&self, session_id: &str, activity: Option<&str>) -> bool {
        let now = Utc::now();
        let mut guard = self.inner.lock();

        let Some(session) = guard.sessions_by_id.get_mut(session_id) else {
            return false;
        };
        if session.state != SessionState::Active {
            return false;
        }
        if now > session.expires_at {
            let id = session.id.clone();
            drop(guard);
            let mut guard = self.inner.lock();
            self.terminate_locked(&mut guard, &id, "hard expiry");
            return false;
        }
        let idle_cutoff = session.last_activity_at
            + ChronoDuration::from_std(self.config.idle_timeout).unwrap_or(ChronoDuration::zero());
        if now > idle_cutoff {
            let id = session.id.clone();
            drop(guard);
            let mut guard = self.inner.lock();
            self.terminate_locked(&mut guard, &id, "idle timeout");
            return false;
        }

        session.last_activity_at = now;
        if let Some(entry) = activity {
            session.recent_activity.push(entry.to_string());
            if session.recent_activity.len() > RECENT_ACTIVITY_CAP {
                let overflow = session.recent_activity.len() - RECENT_ACTIVITY_CAP;
                session.recent_activity.drain(0..overflow);
            }
        }
        true
    }

    /// Validate `session_id` against the caller's current IP and
    /// user-agent. Flags repeated IP changes within the trailing hour as
    /// hijacking-suspected, transitioning the session to `Suspicious` and
    /// revoking both bound tokens.
    #[tracing::instrument(skip(self, current_ua))]
    pub fn validate(&self, session_id: &str, current_ip: &str, current_ua: &str) -> Option<ValidationResult> {
        let now = Utc::now();
        let mut guard = self.inner.lock();
        let session = guard.sessions_by_id.get(session_id)?.clone();

        if session.state != SessionState::Active {
            return Some(ValidationResult {
                valid: false,
                issues: vec![format!("session is {:?}", session.state)],
                session,
            });
        }

        let mut issues = Vec::new();

        let similarity = ua_similarity(&session.device.raw_user_agent, current_ua);
        if similarity < self.config.ua_similarity_threshold {
            issues.push(format!("user-agent similarity {similarity:.2} below threshold"));
        }

        let ip_changed = session.last_ip != current_ip;
        if ip_changed {
            issues.push(format!("ip changed from {} to {current_ip}", session.last_ip));
            let log = guard.ip_change_log.entry(session_id.to_string()).or_default();
            log.push(now);
            log.retain(|t| now - *t <= ChronoDuration::hours(1));
        }

        let changes_last_hour = guard
            .ip_change_log
            .get(session_id)
            .map_or(0, |log| u32::try_from(log.len()).unwrap_or(u32::MAX));

        let hijack_suspected = changes_last_hour > self.config.max_ip_changes_per_hour;

        let Some(session) = guard.sessions_by_id.get_mut(session_id) else {
            return None;
        };
        session.last_ip = current_ip.to_string();
        session.ip_changes_last_hour = changes_last_hour;

        if hijack_suspected {
            session.suspicious = true;
            session.state = SessionState::Suspicious;
            let access_jti = session.access_jti.clone();
            let refresh_jti = session.refresh_jti.clone();
            let expires_at = session.expires_at.timestamp();
            issues.push("hijacking suspected: excessive ip changes".to_string());
            drop(guard);
            self.tokens.revoke_jti(&access_jti, expires_at, "session hijack suspected");
            self.tokens.revoke_jti(&refresh_jti, expires_at, "session hijack suspected");
            let guard = self.inner.lock();
            let session = guard.sessions_by_id.get(session_id)?.clone();
            return Some(ValidationResult {
                valid: false,
                issues,
                session,
            });
        }

        let session = session.clone();
        Some(ValidationResult {
            valid: true,
            issues,
            session,
        })
    }

    /// Terminate a single session, revoking both bound jtis and removing it
    /// from the user index.
    #[tracing::instrument(skip(self))]
    pub fn terminate(&self, session_id: &str, reason: &str) -> bool {
        let mut guard = self.inner.lock();
        self.terminate_locked(&mut guard, session_id, reason)
    }

    /// Terminate every active session for `user_id`, optionally sparing
    /// `except`. Returns the count terminated.
    #[tracing::instrument(skip(self))]
    pub fn terminate_all(&self, user_id: Uuid, except: Option<&str>, reason: &str) -> usize {
        let mut guard = self.inner.lock();
        self.terminate_all_locked(&mut guard, user_id, except, reason)
    }

    fn terminate_locked(&self, guard: &mut UserIndex, session_id: &str, reason: &str) -> bool {
        let Some(session) = guard.sessions_by_id.get_mut(session_id) else {
            return false;
        };
        if session.state == SessionState::Terminated {
            return true;
        }
        session.state = SessionState::Terminated;
        telemetry_metrics::gauge!("active_sessions").decrement(1.0);
        let access_jti = session.access_jti.clone();
        let refresh_jti = session.refresh_jti.clone();
        let exp = session.expires_at.timestamp();
        let user_id = session.user_id;

        if let Some(ids) = guard.ids_by_user.get_mut(&user_id) {
            ids.retain(|id| id != session_id);
        }

        self.tokens.revoke_jti(&access_jti, exp, reason);
        self.tokens.revoke_jti(&refresh_jti, exp, reason);
        true
    }

    fn terminate_all_locked(
        &self,
        guard: &mut UserIndex,
        user_id: Uuid,
        except: Option<&str>,
        reason: &str,
    ) -> usize {
        let ids = guard.ids_by_user.get(&user_id).cloned().unwrap_or_default();
        let mut count = 0;
        for id in ids {
            if Some(id.as_str()) == except {
                continue;
            }
            if self.terminate_locked(guard, &id, reason) {
                count += 1;
            }
        }
        count
    }

    /// Periodic sweep: transitions any session past its hard expiry to
    /// expired and revokes its tokens. Returns the count transitioned.
    #[tracing::instrument(skip(self))]
    pub fn cleanup_sweep(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.inner.lock();
        let expired_ids: Vec<String> = guard
            .sessions_by_id
            .values()
            .filter(|s| s.state == SessionState::Active && now > s.expires_at)
            .map(|s| s.id.clone())
            .collect();

        let mut count = 0;
        for id in expired_ids {
            if let Some(session) = guard.sessions_by_id.get_mut(&id) {
                session.state = SessionState::Expired;
                telemetry_metrics::gauge!("active_sessions").decrement(1.0);
                let access_jti = session.access_jti.clone();
                let refresh_jti = session.refresh_jti.clone();
                let exp = session.expires_at.timestamp();
                let user_id = session.user_id;
                if let Some(ids) = guard.ids_by_user.get_mut(&user_id) {
                    ids.retain(|existing| existing != &id);
                }
                self.tokens.revoke_jti(&access_jti, exp, "expired");
                self.tokens.revoke_jti(&refresh_jti, exp, "expired");
                count += 1;
            }
        }
        count
    }

    /// Fetch a session by id without mutating anything, for inspection.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.lock().sessions_by_id.get(session_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::store::InMemoryStore;
    use std::time::Duration;

    fn registry(config: SessionConfig) -> SessionRegistry {
        let auth = AuthConfig {
            secret_key: "x".repeat(32),
            ..Default::default()
        };
        let tokens = Arc::new(TokenService::new(&auth, Arc::new(InMemoryStore::new())).unwrap());
        SessionRegistry::new(config, tokens)
    }

    fn base_config() -> SessionConfig {
        SessionConfig {
            max_concurrent: 2,
            single_sign_on: false,
            hard_expiry: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(1800),
            ua_similarity_threshold: 0.8,
            max_ip_changes_per_hour: 3,
            cleanup_interval: Duration::from_secs(300),
        }
    }

    #[test]
    fn device_fingerprint_distinguishes_chrome_from_safari() {
        let chrome = parse_device_fingerprint(
            "Mozilla/5.0 (Windows NT 10.0) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
        );
        assert_eq!(chrome.browser_family, "Chrome");
        let safari = parse_device_fingerprint(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
        );
        assert_eq!(safari.browser_family, "Safari");
        assert_eq!(safari.os_family, "Mac OS X");
    }

    #[test]
    fn mobile_device_type_detected() {
        let ua = parse_device_fingerprint("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0) AppleWebKit/605.1.15 Mobile Safari/604.1");
        assert_eq!(ua.device_type, "mobile");
    }

    #[test]
    fn jaccard_empty_sets_are_identical() {
        assert!((ua_similarity("", "") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn jaccard_identical_strings_are_one() {
        assert!((ua_similarity("Chrome Windows", "Chrome Windows") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn jaccard_disjoint_strings_are_zero() {
        assert!(ua_similarity("Chrome Windows", "Firefox Linux").abs() < f64::EPSILON);
    }

    #[test]
    fn concurrency_cap_evicts_oldest() {
        let registry = registry(base_config());
        let user_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();

        let s1 = registry.open(user_id, tenant_id, "1.1.1.1", "ua-1", "jti-a1".to_string(), "jti-r1".to_string());
        std::thread::sleep(Duration::from_millis(5));
        let _s2 = registry.open(user_id, tenant_id, "1.1.1.2", "ua-2", "jti-a2".to_string(), "jti-r2".to_string());
        std::thread::sleep(Duration::from_millis(5));
        let _s3 = registry.open(user_id, tenant_id, "1.1.1.3", "ua-3", "jti-a3".to_string(), "jti-r3".to_string());

        let first = registry.get(&s1.id).unwrap();
        assert_eq!(first.state, SessionState::Terminated);
    }

    #[test]
    fn single_sign_on_terminates_prior_sessions() {
        let mut config = base_config();
        config.single_sign_on = true;
        let registry = registry(config);
        let user_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();

        let s1 = registry.open(user_id, tenant_id, "1.1.1.1", "ua-1", "jti-a1".to_string(), "jti-r1".to_string());
        let _s2 = registry.open(user_id, tenant_id, "1.1.1.2", "ua-2", "jti-a2".to_string(), "jti-r2".to_string());

        assert_eq!(registry.get(&s1.id).unwrap().state, SessionState::Terminated);
    }

    #[test]
    fn terminate_revokes_bound_tokens() {
        let registry = registry(base_config());
        let user_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();
        let session = registry.open(user_id, tenant_id, "1.1.1.1", "ua-1", "jti-a1".to_string(), "jti-r1".to_string());
        assert!(registry.terminate(&session.id, "logout"));
        assert_eq!(registry.get(&session.id).unwrap().state, SessionState::Terminated);
    }

    #[test]
    fn touch_rejects_past_idle_timeout() {
        let mut config = base_config();
        config.idle_timeout = Duration::from_millis(1);
        let registry = registry(config);
        let user_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();
        let session = registry.open(user_id, tenant_id, "1.1.1.1", "ua-1", "jti-a1".to_string(), "jti-r1".to_string());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!registry.touch(&session.id, None));
        assert_eq!(registry.get(&session.id).unwrap().state, SessionState::Terminated);
    }

    #[test]
    fn cleanup_sweep_expires_past_hard_expiry() {
        let mut config = base_config();
        config.hard_expiry = Duration::from_millis(1);
        let registry = registry(config);
        let user_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();
        let session = registry.open(user_id, tenant_id, "1.1.1.1", "ua-1", "jti-a1".to_string(), "jti-r1".to_string());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(registry.cleanup_sweep(), 1);
        assert_eq!(registry.get(&session.id).unwrap().state, SessionState::Expired);
    }
}
