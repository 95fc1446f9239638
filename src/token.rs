//! C2: Token Service. Mints, parses, and validates signed bearer tokens and
//! maintains a jti-keyed revocation set.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{AuthConfig, SigningAlgorithm};
use crate::model::{Principal, TokenKind, User};
use crate::store::{KeyValueStore, KeyValueStoreExt};

/// Claims embedded in every minted token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer.
    pub iss: String,
    /// Audience.
    pub aud: String,
    /// Subject: the user id.
    pub sub: Uuid,
    /// Tenant id.
    pub tenant_id: Uuid,
    /// Email.
    pub email: String,
    /// Role name.
    pub role: String,
    /// Flattened permission list.
    pub permissions: Vec<String>,
    /// Account activation flag, snapshotted at mint time.
    pub active: bool,
    /// MFA-enabled flag, snapshotted at mint time.
    pub mfa_enabled: bool,
    /// `access` or `refresh`.
    pub kind: TokenKind,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Unique token id; the revocation key.
    pub jti: String,
}

impl Claims {
    /// Project onto the smaller [`Principal`] the gateway attaches to a
    /// request once a token has verified.
    #[must_use]
    pub fn principal(&self) -> Principal {
        Principal {
            user_id: self.sub,
            tenant_id: self.tenant_id,
            role: self.role.clone(),
            email: self.email.clone(),
            permissions: self.permissions.clone(),
        }
    }
}

/// Kinds of verification/revocation failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenError {
    /// Token's `exp` is in the past.
    #[error("token expired")]
    Expired,
    /// Signature did not validate.
    #[error("bad signature")]
    BadSignature,
    /// Token could not be parsed as a JWT at all.
    #[error("malformed token")]
    Malformed,
    /// `kind` claim did not match what the caller expected.
    #[error("wrong token kind")]
    WrongKind,
    /// jti is present in the blacklist.
    #[error("token revoked")]
    Revoked,
    /// Anything else.
    #[error("token error: {0}")]
    Other(String),
}

fn blacklist_key(jti: &str) -> String {
    format!("token:blacklist:{jti}")
}

/// Snapshot of a user used to mint a token; kept separate from [`User`] so
/// claims construction does not require the caller to hold a full row
/// (e.g. after a refresh where only a freshly re-fetched profile is
/// available).
#[derive(Debug, Clone)]
pub struct UserSnapshot {
    /// User id.
    pub id: Uuid,
    /// Tenant id.
    pub tenant_id: Uuid,
    /// Email.
    pub email: String,
    /// Role name.
    pub role: String,
    /// Flattened permissions.
    pub permissions: Vec<String>,
    /// Activation flag.
    pub active: bool,
    /// MFA-enabled flag.
    pub mfa_enabled: bool,
}

impl From<&User> for UserSnapshot {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            tenant_id: user.tenant_id,
            email: user.email.clone(),
            role: user.role.clone(),
            permissions: crate::model::system_role_permissions(&user.role),
            active: user.active,
            mfa_enabled: user.mfa_enabled,
        }
    }
}

enum Keys {
    Hmac { secret: Vec<u8> },
    Rsa { encoding: Box<EncodingKey>, decoding: Box<DecodingKey> },
}

/// Mints, verifies, and revokes bearer tokens.
pub struct TokenService {
    keys: Keys,
    algorithm: Algorithm,
    issuer: String,
    audience: String,
    store: Arc<dyn KeyValueStore>,
}

impl TokenService {
    /// Build a token service from configuration. Per the documented
    /// resolution of the asymmetric-key open question, this never falls
    /// back to a generated keypair: `Config::validate` already rejects an
    /// `rs256` configuration missing key material before this is called, so
    /// key construction here only has to handle well-formed PEM.
    ///
    /// # Errors
    ///
    /// Returns an error if RSA key material is configured but not valid PEM.
    pub fn new(config: &AuthConfig, store: Arc<dyn KeyValueStore>) -> crate::error::Result<Self> {
        let (keys, algorithm) = match config.algorithm {
            SigningAlgorithm::Hs256 => (
                Keys::Hmac {
                    secret: config.secret_key.as_bytes().to_vec(),
                },
                Algorithm::HS256,
            ),
            SigningAlgorithm::Rs256 => {
                let private_pem = config.private_key_pem.as_deref().ok_or_else(|| {
                    crate::error::Error::Internal("rs256 requires private_key_pem".to_string())
                })?;
                let public_pem = config.public_key_pem.as_deref().ok_or_else(|| {
                    crate::error::Error::Internal("rs256 requires public_key_pem".to_string())
                })?;
                let encoding = EncodingKey::from_rsa_pem(private_pem.as_bytes())
                    .map_err(|e| crate::error::Error::Internal(format!("invalid private key: {e}")))?;
                let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
                    .map_err(|e| crate::error::Error::Internal(format!("invalid public key: {e}")))?;
                (
                    Keys::Rsa {
                        encoding: Box::new(encoding),
                        decoding: Box::new(decoding),
                    },
                    Algorithm::RS256,
                )
            }
        };

        Ok(Self {
            keys,
            algorithm,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            store,
        })
    }

    fn encoding_key(&self) -> EncodingKey {
        match &self.keys {
            Keys::Hmac { secret } => EncodingKey::from_secret(secret),
            Keys::Rsa { encoding, .. } => (**encoding).clone(),
        }
    }

    fn decoding_key(&self) -> DecodingKey {
        match &self.keys {
            Keys::Hmac { secret } => DecodingKey::from_secret(secret),
            Keys::Rsa { decoding, .. } => (**decoding).clone(),
        }
    }

    /// Mint a token for `user`. Claims are bit-for-bit stable across mints
    /// with identical inputs except `jti` and timestamps.
    ///
    /// # Errors
    ///
    /// Returns an error if JWT encoding fails (only on key misconfiguration,
    /// already excluded by [`TokenService::new`]).
    #[tracing::instrument(skip(self, user), fields(user_id = %user.id, kind = %kind))]
    pub fn mint(
        &self,
        user: &UserSnapshot,
        kind: TokenKind,
        lifetime: Duration,
    ) -> crate::error::Result<(String, String, i64)> {
        let now = chrono::Utc::now().timestamp();
        let exp = now + i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX);
        let jti = Uuid::new_v4().to_string();

        let claims = Claims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: user.id,
            tenant_id: user.tenant_id,
            email: user.email.clone(),
            role: user.role.clone(),
            permissions: user.permissions.clone(),
            active: user.active,
            mfa_enabled: user.mfa_enabled,
            kind,
            iat: now,
            exp,
            jti: jti.clone(),
        };

        let header = Header::new(self.algorithm);
        let token = encode(&header, &claims, &self.encoding_key())
            .map_err(|e| crate::error::Error::Internal(format!("token mint failed: {e}")))?;

        Ok((token, jti, exp))
    }

    /// Verify `token`, checking signature, issuer, audience, expiry, kind,
    /// and blacklist non-membership.
    ///
    /// # Errors
    ///
    /// Returns the specific [`TokenError`] variant describing why
    /// verification failed.
    #[tracing::instrument(skip(self, token))]
    pub fn verify(&self, token: &str, expected_kind: TokenKind) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        // Default leeway is 60s; this crate enforces `exp` exactly.
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding_key(), &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::BadSignature,
                ErrorKind::InvalidToken | ErrorKind::Json(_) | ErrorKind::Utf8(_) => TokenError::Malformed,
                _ => TokenError::Other(e.to_string()),
            }
        })?;

        if data.claims.kind != expected_kind {
            return Err(TokenError::WrongKind);
        }

        match self.store.get_json::<String>(&blacklist_key(&data.claims.jti)) {
            Ok(Some(_reason)) => return Err(TokenError::Revoked),
            Ok(None) => {}
            Err(error) => {
                // Fail-open per §7: store errors during the blacklist check
                // never block an otherwise-valid token, but are loud.
                tracing::warn!(%error, jti = %data.claims.jti, "blacklist check failed, allowing token");
            }
        }

        Ok(data.claims)
    }

    /// Revoke `token` by jti, with TTL = max(0, exp - now). Idempotent:
    /// revoking an already-revoked or expired token is a no-op success.
    ///
    /// # Errors
    ///
    /// Never returns `Err`; failures are reported via the boolean result
    /// instead, matching the "non-fatal at logout" failure policy.
    pub fn revoke(&self, token: &str, reason: &str) -> bool {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.validate_exp = false;

        let Ok(data) = decode::<Claims>(token, &self.decoding_key(), &validation) else {
            return false;
        };
        self.revoke_jti(&data.claims.jti, data.claims.exp, reason)
    }

    /// Revoke a specific jti directly, used by the Session Registry when
    /// terminating a session without holding the raw token string.
    pub fn revoke_jti(&self, jti: &str, exp: i64, reason: &str) -> bool {
        let now = chrono::Utc::now().timestamp();
        let ttl_secs = u64::try_from(exp - now).unwrap_or(0);
        self.store
            .set_json(&blacklist_key(jti), &reason.to_string(), Some(Duration::from_secs(ttl_secs)))
            .is_ok()
    }

    /// Revoke `jti` only if it is not already blacklisted, atomically with
    /// respect to concurrent callers racing the same jti. Returns whether
    /// this call won the race — the single-use gate a refresh-token
    /// exchange needs: exactly one of two concurrent attempts against the
    /// same token may proceed to mint a new pair.
    ///
    /// Unlike [`TokenService::revoke_jti`], this is not idempotent by
    /// design: a second call against an already-blacklisted jti returns
    /// `false` rather than silently succeeding.
    pub fn revoke_jti_if_absent(&self, jti: &str, exp: i64, reason: &str) -> bool {
        let now = chrono::Utc::now().timestamp();
        let ttl_secs = u64::try_from(exp - now).unwrap_or(0);
        self.store
            .set_json_if_absent(&blacklist_key(jti), &reason.to_string(), Some(Duration::from_secs(ttl_secs)))
            .unwrap_or(false)
    }
}
