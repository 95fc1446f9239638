//! C7: Credential Selector. Picks among a tenant's active provider
//! credentials by strategy, and runs lightweight upstream probes. Internal
//! only — never exposed on the public gateway router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::SecretStore;
use crate::error::{Error, Result};
use crate::model::{Provider, ProviderCredential, Scoped};

/// Selection strategy, mirroring the source channel selector's modes minus
/// the weighted-random variant (which depends on live health metrics this
/// crate does not collect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Earliest-created active credential, filtered by provider list.
    FirstAvailable,
    /// Same candidate ordering, rotated by a per-tenant cursor.
    RoundRobin,
    /// Longest idle time since last use; ties broken by creation time.
    LeastUsed,
}

/// Selection parameters.
#[derive(Debug, Clone, Default)]
pub struct SelectParams {
    /// Selection strategy.
    pub strategy: Option<SelectionStrategy>,
    /// Restrict candidates to active credentials only (default true).
    pub only_active: Option<bool>,
    /// Restrict candidates to these providers.
    pub providers: Option<Vec<Provider>>,
}

/// A credential with its secret decrypted, returned only to internal
/// service principals that have already asserted a tenant context.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    /// Credential id.
    pub id: Uuid,
    /// Provider tag.
    pub provider: Provider,
    /// Display name.
    pub display_name: String,
    /// Decrypted secret (e.g. an API key).
    pub secret: String,
    /// Optional endpoint override.
    pub endpoint: Option<String>,
    /// Free-form per-model configuration.
    pub model_configs: serde_json::Value,
}

/// Kind of probe to run in [`CredentialSelector::test`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    /// Lightweight GET of the provider's model-list endpoint.
    ModelList,
    /// A minimal chat/completion call (<= 5 tokens).
    MinimalCompletion,
}

/// Probe error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeError {
    Timeout,
    Unauthorized,
    RateLimited,
    Other,
}

/// Outcome of [`CredentialSelector::test`].
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    /// Whether the probe succeeded.
    pub success: bool,
    /// Wall-clock duration of the probe.
    pub ms: u64,
    /// Error classification, when `success` is false.
    pub error: Option<ProbeError>,
    /// Free-form diagnostic details.
    pub details: Option<String>,
}

/// Repository abstraction the selector is built over; a real deployment
/// backs this with the tenant-scoped credential table.
pub trait CredentialRepository: Send + Sync {
    /// All credentials for `tenant_id`, newest-last is not guaranteed; the
    /// selector sorts as needed.
    fn list_for_tenant(&self, tenant_id: Uuid) -> Vec<ProviderCredential>;

    /// Fetch one credential, tenant-scoped via [`Scoped`]: callers must
    /// present the matching tenant id to unwrap it.
    fn get(&self, credential_id: Uuid) -> Option<Scoped<ProviderCredential>>;
}

/// In-memory [`CredentialRepository`], standing in for the relational table.
#[derive(Default)]
pub struct InMemoryCredentialRepository {
    by_id: Mutex<HashMap<Uuid, ProviderCredential>>,
}

impl InMemoryCredentialRepository {
    /// Construct an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a credential.
    pub fn put(&self, credential: ProviderCredential) {
        self.by_id.lock().insert(credential.id, credential);
    }
}

impl CredentialRepository for InMemoryCredentialRepository {
    fn list_for_tenant(&self, tenant_id: Uuid) -> Vec<ProviderCredential> {
        self.by_id
            .lock()
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    fn get(&self, credential_id: Uuid) -> Option<Scoped<ProviderCredential>> {
        let guard = self.by_id.lock();
        let credential = guard.get(&credential_id)?.clone();
        Some(Scoped::new(credential.tenant_id, credential))
    }
}

/// Selects among a tenant's credentials and runs lightweight probes.
/// Internal-only: the gateway router must never route a public path to
/// this component's operations directly.
pub struct CredentialSelector {
    repo: Arc<dyn CredentialRepository>,
    secrets: Arc<SecretStore>,
    cursors: Mutex<HashMap<Uuid, usize>>,
    http_client: reqwest::Client,
}

/// Provider-specific probe target: base URL and the header that carries the
/// credential's secret.
struct ProviderEndpoint {
    models_url: String,
    completions_url: String,
    auth_header: &'static str,
    auth_value: String,
    extra_headers: &'static [(&'static str, &'static str)],
}

fn provider_endpoint(provider: Provider, secret: &str, endpoint_override: Option<&str>) -> std::result::Result<ProviderEndpoint, String> {
    let base = match (provider, endpoint_override) {
        (_, Some(custom)) => custom.trim_end_matches('/').to_string(),
        (Provider::Openai, None) => "https://api.openai.com/v1".to_string(),
        (Provider::Deepseek, None) => "https://api.deepseek.com/v1".to_string(),
        (Provider::Anthropic, None) => "https://api.anthropic.com/v1".to_string(),
        (Provider::Google, None) => "https://generativelanguage.googleapis.com/v1beta".to_string(),
        (Provider::Azure, None) => return Err("azure credentials require an endpoint override".to_string()),
        (Provider::Custom, None) => return Err("custom credentials require an endpoint override".to_string()),
    };

    Ok(match provider {
        Provider::Anthropic => ProviderEndpoint {
            models_url: format!("{base}/models"),
            completions_url: format!("{base}/messages"),
            auth_header: "x-api-key",
            auth_value: secret.to_string(),
            extra_headers: &[("anthropic-version", "2023-06-01")],
        },
        Provider::Google => ProviderEndpoint {
            models_url: format!("{base}/models?key={secret}"),
            completions_url: format!("{base}/models/gemini-pro:generateContent?key={secret}"),
            auth_header: "x-goog-api-key",
            auth_value: secret.to_string(),
            extra_headers: &[],
        },
        Provider::Azure => ProviderEndpoint {
            models_url: format!("{base}/models"),
            completions_url: format!("{base}/chat/completions"),
            auth_header: "api-key",
            auth_value: secret.to_string(),
            extra_headers: &[],
        },
        Provider::Openai | Provider::Deepseek | Provider::Custom => ProviderEndpoint {
            models_url: format!("{base}/models"),
            completions_url: format!("{base}/chat/completions"),
            auth_header: "authorization",
            auth_value: format!("Bearer {secret}"),
            extra_headers: &[],
        },
    })
}

fn classify_status(status: reqwest::StatusCode) -> ProbeError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        ProbeError::Unauthorized
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ProbeError::RateLimited
    } else {
        ProbeError::Other
    }
}

fn classify_transport_error(err: &reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        ProbeError::Timeout
    } else {
        ProbeError::Other
    }
}

impl CredentialSelector {
    /// Build a selector over a repository and the secret store used to
    /// decrypt returned secrets.
    #[must_use]
    pub fn new(repo: Arc<dyn CredentialRepository>, secrets: Arc<SecretStore>) -> Self {
        Self {
            repo,
            secrets,
            cursors: Mutex::new(HashMap::new()),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn decrypt(&self, credential: &ProviderCredential) -> Result<String> {
        let plaintext = self.secrets.decrypt(&credential.encrypted_secret)?;
        String::from_utf8(plaintext).map_err(|e| Error::Internal(format!("decrypted secret not utf-8: {e}")))
    }

    fn view(&self, credential: &ProviderCredential) -> Result<CredentialView> {
        Ok(CredentialView {
            id: credential.id,
            provider: credential.provider,
            display_name: credential.display_name.clone(),
            secret: self.decrypt(credential)?,
            endpoint: credential.endpoint.clone(),
            model_configs: credential.model_configs.clone(),
        })
    }

    /// Select credentials for `tenant_id` per `params`.
    ///
    /// # Errors
    ///
    /// Returns an error if decryption of a selected credential's secret
    /// fails.
    #[tracing::instrument(skip(self, params), fields(%tenant_id))]
    pub fn select(&self, tenant_id: Uuid, params: &SelectParams) -> Result<Vec<CredentialView>> {
        let only_active = params.only_active.unwrap_or(true);
        let mut candidates: Vec<ProviderCredential> = self
            .repo
            .list_for_tenant(tenant_id)
            .into_iter()
            .filter(|c| !only_active || c.active)
            .filter(|c| params.providers.as_ref().is_none_or(|ps| ps.contains(&c.provider)))
            .collect();

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        match params.strategy.unwrap_or(SelectionStrategy::FirstAvailable) {
            SelectionStrategy::FirstAvailable => {
                candidates.sort_by_key(|c| c.created_at);
                candidates.truncate(1);
            }
            SelectionStrategy::RoundRobin => {
                candidates.sort_by_key(|c| c.created_at);
                let mut cursors = self.cursors.lock();
                let cursor = cursors.entry(tenant_id).or_insert(0);
                let index = *cursor % candidates.len();
                *cursor = (*cursor + 1) % candidates.len();
                let chosen = candidates.swap_remove(index);
                candidates = vec![chosen];
            }
            SelectionStrategy::LeastUsed => {
                candidates.sort_by(|a, b| {
                    let a_idle = a.last_used_at.unwrap_or(a.created_at);
                    let b_idle = b.last_used_at.unwrap_or(b.created_at);
                    a_idle.cmp(&b_idle).then_with(|| a.created_at.cmp(&b.created_at))
                });
                candidates.truncate(1);
            }
        }

        candidates.iter().map(|c| self.view(c)).collect()
    }

    /// Fetch a single credential, tenant-scoped; returns `None` (not an
    /// error, not `Forbidden`) whenever `credential_id` belongs to a
    /// different tenant or does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if decryption of the secret fails.
    pub fn get(&self, credential_id: Uuid, tenant_id: Uuid) -> Result<Option<CredentialView>> {
        let Some(scoped) = self.repo.get(credential_id) else {
            return Ok(None);
        };
        let Some(credential) = scoped.into_inner_for(tenant_id) else {
            return Ok(None);
        };
        self.view(&credential).map(Some)
    }

    /// Probe a credential's connectivity against the real provider: a
    /// `ModelList` test issues a lightweight GET of the model catalog, a
    /// `MinimalCompletion` test issues a <= 5 token completion call.
    ///
    /// # Errors
    ///
    /// Never returns `Err`; failures are reported via `ProbeResult.error`.
    #[tracing::instrument(skip(self))]
    pub async fn test(&self, credential_id: Uuid, tenant_id: Uuid, test_type: TestType) -> ProbeResult {
        let start = Instant::now();
        let view = match self.get(credential_id, tenant_id) {
            Ok(Some(view)) => view,
            Ok(None) => {
                return ProbeResult {
                    success: false,
                    ms: duration_ms(start.elapsed()),
                    error: Some(ProbeError::Other),
                    details: Some("credential not found".to_string()),
                };
            }
            Err(_) => {
                return ProbeResult {
                    success: false,
                    ms: duration_ms(start.elapsed()),
                    error: Some(ProbeError::Other),
                    details: Some("decryption failed".to_string()),
                };
            }
        };

        let endpoint = match provider_endpoint(view.provider, &view.secret, view.endpoint.as_deref()) {
            Ok(endpoint) => endpoint,
            Err(message) => {
                return ProbeResult {
                    success: false,
                    ms: duration_ms(start.elapsed()),
                    error: Some(ProbeError::Other),
                    details: Some(message),
                };
            }
        };

        let mut request = match test_type {
            TestType::ModelList => self.http_client.get(&endpoint.models_url),
            TestType::MinimalCompletion => self
                .http_client
                .post(&endpoint.completions_url)
                .json(&minimal_completion_body(view.provider)),
        };
        request = request.header(endpoint.auth_header, &endpoint.auth_value);
        for (name, value) in endpoint.extra_headers {
            request = request.header(*name, *value);
        }

        let outcome = request.send().await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(response) if response.status().is_success() => ProbeResult {
                success: true,
                ms: duration_ms(elapsed),
                error: None,
                details: Some(format!("{test_type:?} probe ok for {}", view.provider)),
            },
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                ProbeResult {
                    success: false,
                    ms: duration_ms(elapsed),
                    error: Some(classify_status(status)),
                    details: Some(format!("upstream responded {status}: {}", truncate(&body, 500))),
                }
            }
            Err(err) => ProbeResult {
                success: false,
                ms: duration_ms(elapsed),
                error: Some(classify_transport_error(&err)),
                details: Some(err.to_string()),
            },
        }
    }
}

fn minimal_completion_body(provider: Provider) -> serde_json::Value {
    match provider {
        Provider::Anthropic => serde_json::json!({
            "model": "claude-3-haiku-20240307",
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "hi"}],
        }),
        Provider::Google => serde_json::json!({
            "contents": [{"parts": [{"text": "hi"}]}],
            "generationConfig": {"maxOutputTokens": 1},
        }),
        Provider::Openai | Provider::Deepseek | Provider::Azure | Provider::Custom => serde_json::json!({
            "model": "gpt-3.5-turbo",
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "hi"}],
        }),
    }
}

fn truncate(s: &str, max: usize) -> String {
    let mut out = s.to_string();
    out.truncate(max);
    out
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
