//! C8: Policy Engine. Password strength scoring and IP admission, plus a
//! single mutable policy document with bounds-checked updates.

use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::config::{IpPolicyConfig, PasswordPolicyConfig};
use crate::error::{Error, Result};
use crate::store::{KeyValueStore, KeyValueStoreExt};

const POLICY_DOC_KEY: &str = "policy:document";
const AUTOBAN_COUNTER_PREFIX: &str = "policy:autoban:count:";
const AUTOBAN_ENTRY_PREFIX: &str = "policy:autoban:entry:";

/// Common weak passwords checked as a case-insensitive substring, grounded
/// on the source policy engine's deny-list approach (not exhaustive; a
/// production deployment would load a larger list).
const COMMON_PASSWORDS: &[&str] = &[
    "password", "123456", "12345678", "qwerty", "letmein", "admin123", "welcome", "monkey", "dragon", "football",
];

/// Strength classification, derived from `score`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordLevel {
    VeryWeak,
    Weak,
    Medium,
    Strong,
    Excellent,
}

/// Outcome of password validation.
#[derive(Debug, Clone)]
pub struct PasswordAssessment {
    /// Whether the password satisfies every configured requirement.
    pub valid: bool,
    /// Violated requirements, human-readable.
    pub errors: Vec<String>,
    /// Deterministic strength score, 0-100.
    pub score: u32,
    /// Strength classification.
    pub level: PasswordLevel,
}

/// Evaluate `plaintext` against `policy`, optionally checking it does not
/// contain `user_info` fields (email local-part, username) as a substring.
#[must_use]
pub fn assess_password(plaintext: &str, policy: &PasswordPolicyConfig, user_info: &[&str]) -> PasswordAssessment {
    let mut errors = Vec::new();

    if plaintext.len() < policy.min_length {
        errors.push(format!("password must be at least {} characters", policy.min_length));
    }
    if plaintext.len() > policy.max_length {
        errors.push(format!("password must be at most {} characters", policy.max_length));
    }

    let has_upper = plaintext.chars().any(char::is_uppercase);
    let has_lower = plaintext.chars().any(char::is_lowercase);
    let has_digit = plaintext.chars().any(|c| c.is_ascii_digit());
    let has_special = plaintext.chars().any(|c| policy.special_chars.contains(c));

    if policy.require_uppercase && !has_upper {
        errors.push("password must contain an uppercase letter".to_string());
    }
    if policy.require_lowercase && !has_lower {
        errors.push("password must contain a lowercase letter".to_string());
    }
    if policy.require_digits && !has_digit {
        errors.push("password must contain a digit".to_string());
    }
    if policy.require_special_chars && !has_special {
        errors.push("password must contain a special character".to_string());
    }

    if policy.prevent_common_passwords {
        let lower = plaintext.to_lowercase();
        if COMMON_PASSWORDS.iter().any(|p| lower.contains(p)) {
            errors.push("password is too common".to_string());
        }
    }

    if policy.prevent_user_info_in_password {
        let lower = plaintext.to_lowercase();
        for info in user_info {
            let info_lower = info.to_lowercase();
            if !info_lower.is_empty() && lower.contains(&info_lower) {
                errors.push("password must not contain your username or email".to_string());
                break;
            }
        }
    }

    let score = score_password(plaintext, has_upper, has_lower, has_digit, has_special);
    let level = match score {
        90..=100 => PasswordLevel::Excellent,
        70..=89 => PasswordLevel::Strong,
        50..=69 => PasswordLevel::Medium,
        30..=49 => PasswordLevel::Weak,
        _ => PasswordLevel::VeryWeak,
    };

    PasswordAssessment {
        valid: errors.is_empty(),
        errors,
        score,
        level,
    }
}

fn score_password(plaintext: &str, has_upper: bool, has_lower: bool, has_digit: bool, has_special: bool) -> u32 {
    let mut score: u32 = 0;
    let len = plaintext.chars().count();

    if len >= 8 {
        score += 20;
    }
    if len >= 12 {
        score += 10;
    }
    if len >= 16 {
        score += 10;
    }

    if has_lower {
        score += 10;
    }
    if has_upper {
        score += 10;
    }
    if has_digit {
        score += 10;
    }
    if has_special {
        score += 15;
    }

    let class_count = [has_lower, has_upper, has_digit, has_special].iter().filter(|v| **v).count();
    if class_count >= 3 {
        score += 15;
    }

    score.min(100)
}

/// IP admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpDecision {
    /// Admit the request.
    Admit,
    /// Deny: matched the deny-list.
    DeniedByBlacklist,
    /// Deny: allow-list is enabled and non-empty, and the IP did not match.
    DeniedByWhitelist,
    /// Deny: the IP is under an active auto-ban.
    DeniedByAutoBan,
}

impl IpDecision {
    #[must_use]
    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admit)
    }
}

fn parse_ip(ip: &str) -> Option<std::net::IpAddr> {
    ip.parse().ok()
}

fn matches_any(ip: std::net::IpAddr, ranges: &[String]) -> bool {
    ranges.iter().filter_map(|r| r.parse::<IpNet>().ok()).any(|net| net.contains(&ip))
}

/// The Policy Engine: password assessment, IP admission, and the
/// auto-ban/failed-attempt counters backing it, plus a single mutable
/// policy document.
pub struct PolicyEngine {
    store: Arc<dyn KeyValueStore>,
}

impl PolicyEngine {
    /// Build a policy engine over a key-value store used for the auto-ban
    /// counters and the policy document.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Decide whether `ip` may proceed, per the configured precedence:
    /// deny-list wins outright; else an enabled non-empty allow-list is
    /// exclusive; else an active auto-ban denies; else admit.
    #[tracing::instrument(skip(self, policy))]
    pub fn check_ip(&self, ip: &str, policy: &IpPolicyConfig) -> IpDecision {
        let Some(parsed) = parse_ip(ip) else {
            return IpDecision::Admit;
        };

        if policy.blacklist_enabled && matches_any(parsed, &policy.blocked_ip_ranges) {
            return IpDecision::DeniedByBlacklist;
        }

        if policy.whitelist_enabled && !policy.allowed_ip_ranges.is_empty() {
            if matches_any(parsed, &policy.allowed_ip_ranges) {
                return IpDecision::Admit;
            }
            return IpDecision::DeniedByWhitelist;
        }

        if policy.auto_block_suspicious_ips {
            let entry_key = format!("{AUTOBAN_ENTRY_PREFIX}{ip}");
            if let Ok(Some(_banned_until)) = self.store.get_json::<i64>(&entry_key) {
                return IpDecision::DeniedByAutoBan;
            }
        }

        IpDecision::Admit
    }

    /// Record a failed login attempt for `ip`. When the rolling 1-hour
    /// count reaches `policy.auto_block_threshold`, inserts an auto-ban
    /// entry for `policy.block_duration_hours` and resets the counter.
    #[tracing::instrument(skip(self, policy))]
    pub fn record_failed_login(&self, ip: &str, policy: &IpPolicyConfig) {
        if !policy.auto_block_suspicious_ips {
            return;
        }
        let counter_key = format!("{AUTOBAN_COUNTER_PREFIX}{ip}");
        let count = self.store.incr(&counter_key, Duration::from_secs(3600));
        if count >= u64::from(policy.auto_block_threshold) {
            let entry_key = format!("{AUTOBAN_ENTRY_PREFIX}{ip}");
            let ban_duration = Duration::from_secs(policy.block_duration_hours * 3600);
            let banned_until = chrono::Utc::now().timestamp() + i64::try_from(ban_duration.as_secs()).unwrap_or(0);
            let _ = self.store.set_json(&entry_key, &banned_until, Some(ban_duration));
            self.store.delete(&counter_key);
        }
    }

    /// Load the policy document, initializing a defaults object on first
    /// read if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if a stored document exists but fails to
    /// deserialize.
    pub fn load_document(&self) -> Result<PolicyDocument> {
        if let Some(doc) = self.store.get_json::<PolicyDocument>(POLICY_DOC_KEY)? {
            return Ok(doc);
        }
        let defaults = PolicyDocument::default();
        self.store.set_json(POLICY_DOC_KEY, &defaults, None)?;
        Ok(defaults)
    }

    /// Validate and persist an updated policy document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if any bound is violated.
    pub fn update_document(&self, doc: PolicyDocument) -> Result<PolicyDocument> {
        doc.validate()?;
        self.store.set_json(POLICY_DOC_KEY, &doc, None)?;
        Ok(doc)
    }
}

/// The single mutable policy document, bounds-checked on every update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDocument {
    /// Minimum password length, bounded [4, 256].
    pub min_password_length: usize,
    /// Session idle timeout in minutes, bounded [5, 1440].
    pub session_timeout_minutes: u32,
    /// Failed-login attempts before lockout, bounded [1, 50].
    pub max_failed_attempts: u32,
    /// Audit/session retention in days, bounded [1, 2555].
    pub retention_days: u32,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            min_password_length: 8,
            session_timeout_minutes: 60,
            max_failed_attempts: 5,
            retention_days: 90,
        }
    }
}

impl PolicyDocument {
    /// Validate every bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] listing every violated bound.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if !(4..=256).contains(&self.min_password_length) {
            errors.push("min_password_length must be in [4, 256]".to_string());
        }
        if !(5..=1440).contains(&self.session_timeout_minutes) {
            errors.push("session_timeout_minutes must be in [5, 1440]".to_string());
        }
        if !(1..=50).contains(&self.max_failed_attempts) {
            errors.push("max_failed_attempts must be in [1, 50]".to_string());
        }
        if !(1..=2555).contains(&self.retention_days) {
            errors.push("retention_days must be in [1, 2555]".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidInput(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn strong_password_scores_excellent() {
        let policy = PasswordPolicyConfig::default();
        let assessment = assess_password("Correct-Horse-Battery99!", &policy, &[]);
        assert!(assessment.valid);
        assert_eq!(assessment.level, PasswordLevel::Excellent);
    }

    #[test]
    fn short_password_is_invalid_and_weak() {
        let policy = PasswordPolicyConfig::default();
        let assessment = assess_password("ab1!", &policy, &[]);
        assert!(!assessment.valid);
        assert_eq!(assessment.level, PasswordLevel::VeryWeak);
    }

    #[test]
    fn common_password_rejected() {
        let policy = PasswordPolicyConfig::default();
        let assessment = assess_password("Password123!", &policy, &[]);
        assert!(assessment.errors.iter().any(|e| e.contains("too common")));
    }

    #[test]
    fn user_info_in_password_rejected() {
        let policy = PasswordPolicyConfig::default();
        let assessment = assess_password("alice-Secret99!", &policy, &["alice"]);
        assert!(assessment.errors.iter().any(|e| e.contains("username or email")));
    }

    #[test]
    fn score_is_deterministic_and_capped() {
        let policy = PasswordPolicyConfig::default();
        let a = assess_password("Aa1!Aa1!Aa1!Aa1!", &policy, &[]);
        let b = assess_password("Aa1!Aa1!Aa1!Aa1!", &policy, &[]);
        assert_eq!(a.score, b.score);
        assert!(a.score <= 100);
    }

    #[test]
    fn ip_blacklist_wins_over_whitelist() {
        let store = Arc::new(InMemoryStore::new());
        let engine = PolicyEngine::new(store);
        let policy = IpPolicyConfig {
            blacklist_enabled: true,
            blocked_ip_ranges: vec!["10.0.0.0/8".to_string()],
            whitelist_enabled: true,
            allowed_ip_ranges: vec!["10.0.0.0/8".to_string()],
            auto_block_suspicious_ips: false,
            auto_block_threshold: 10,
            block_duration_hours: 1,
        };
        assert_eq!(engine.check_ip("10.1.2.3", &policy), IpDecision::DeniedByBlacklist);
    }

    #[test]
    fn whitelist_denies_non_matching_ip() {
        let store = Arc::new(InMemoryStore::new());
        let engine = PolicyEngine::new(store);
        let policy = IpPolicyConfig {
            blacklist_enabled: false,
            blocked_ip_ranges: vec![],
            whitelist_enabled: true,
            allowed_ip_ranges: vec!["10.0.0.0/8".to_string()],
            auto_block_suspicious_ips: false,
            auto_block_threshold: 10,
            block_duration_hours: 1,
        };
        assert_eq!(engine.check_ip("1.2.3.4", &policy), IpDecision::DeniedByWhitelist);
        assert_eq!(engine.check_ip("10.1.2.3", &policy), IpDecision::Admit);
    }

    #[test]
    fn auto_ban_triggers_after_threshold() {
        let store = Arc::new(InMemoryStore::new());
        let engine = PolicyEngine::new(store);
        let policy = IpPolicyConfig {
            blacklist_enabled: false,
            blocked_ip_ranges: vec![],
            whitelist_enabled: false,
            allowed_ip_ranges: vec![],
            auto_block_suspicious_ips: true,
            auto_block_threshold: 3,
            block_duration_hours: 1,
        };
        for _ in 0..3 {
            engine.record_failed_login("2.2.2.2", &policy);
        }
        assert_eq!(engine.check_ip("2.2.2.2", &policy), IpDecision::DeniedByAutoBan);
    }

    #[test]
    fn policy_document_defaults_on_first_read() {
        let store = Arc::new(InMemoryStore::new());
        let engine = PolicyEngine::new(store);
        let doc = engine.load_document().unwrap();
        assert_eq!(doc, PolicyDocument::default());
    }

    #[test]
    fn policy_document_update_rejects_out_of_bounds() {
        let store = Arc::new(InMemoryStore::new());
        let engine = PolicyEngine::new(store);
        let mut doc = PolicyDocument::default();
        doc.min_password_length = 2;
        assert!(engine.update_document(doc).is_err());
    }
}
