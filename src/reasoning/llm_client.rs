//! Language-Model Client — HTTP backend with response cache and retry
//!
//! Abstraction over the external language-model service. The trait seam
//! lets tests substitute a scripted backend; production uses
//! [`HttpLlmClient`] over reqwest.
//!
//! Responses are cached in the shared cache keyed by a stable hash of
//! `(model, temperature, system_prompt :: user_prompt)`. Cache failures are
//! never fatal — log and continue with a live call.

use crate::cache::SharedCache;
use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Retry policy for transient model-call failures.
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_MIN: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model service returned status {0}: {1}")]
    Service(u16, String),
    #[error("malformed model response: {0}")]
    Malformed(String),
}

/// Request handed to the model backend.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Model response with token accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub model: String,
}

/// Backend seam: one implementation per model service.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Single uncached, unretried completion call.
    async fn generate_raw(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Model identifier used for cache keys and persisted hypotheses.
    fn model_id(&self) -> &str;
}

/// Cache-fronted, retried completion call.
///
/// Lookup order: shared cache → live call with up to [`MAX_ATTEMPTS`]
/// attempts and exponential backoff → cache write-back. Cache read or
/// write failures degrade to a live call with a warning.
pub async fn generate(
    client: &dyn LlmClient,
    cache: Option<&SharedCache>,
    cache_ttl_seconds: u64,
    request: &LlmRequest,
) -> Result<LlmResponse, LlmError> {
    let key = cache_key(client.model_id(), request);

    if let Some(cache) = cache {
        match cache.get(&key).await {
            Ok(Some(cached_json)) => match serde_json::from_str::<LlmResponse>(&cached_json) {
                Ok(response) => {
                    info!(key = %key, "model response cache hit");
                    return Ok(response);
                }
                Err(e) => warn!(key = %key, error = %e, "dropping unparseable cached response"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "model cache read failed, continuing uncached"),
        }
    }

    let response = generate_with_retry(client, request).await?;

    if let Some(cache) = cache {
        match serde_json::to_string(&response) {
            Ok(json) => {
                if let Err(e) = cache.set_ex(&key, &json, cache_ttl_seconds).await {
                    warn!(error = %e, "model cache write failed, continuing");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize model response for cache"),
        }
    }

    Ok(response)
}

async fn generate_with_retry(
    client: &dyn LlmClient,
    request: &LlmRequest,
) -> Result<LlmResponse, LlmError> {
    let mut backoff = BACKOFF_MIN;
    let mut last_err = None;

    for attempt in 1..=MAX_ATTEMPTS {
        match client.generate_raw(request).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                warn!(attempt, error = %e, "model call failed");
                last_err = Some(e);
                if attempt < MAX_ATTEMPTS {
                    // Jittered exponential backoff to avoid thundering herds
                    let jitter_ms = rand::thread_rng().gen_range(0..250);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    Err(last_err.unwrap_or(LlmError::Malformed("no attempts made".to_string())))
}

/// Deterministic cache key: `llm_cache:{md5(model:temp:system::prompt)}`.
fn cache_key(model: &str, request: &LlmRequest) -> String {
    let key_content = format!(
        "{}:{}:{}::{}",
        model,
        request.temperature,
        request.system_prompt.trim(),
        request.user_prompt.trim()
    );
    let digest = md5::compute(key_content.as_bytes());
    format!("llm_cache:{digest:x}")
}

/// Extract a JSON document from a model response that may be wrapped in a
/// fenced code block (` ```json ... ``` ` or ` ``` ... ``` `). The first
/// block wins; bare JSON falls through unchanged.
pub fn extract_json(content: &str) -> &str {
    static CODE_BLOCK_RE: OnceLock<Regex> = OnceLock::new();
    let re = CODE_BLOCK_RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?\s*```").unwrap()
    });

    let content = content.trim();
    match re.captures(content).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim(),
        None => content,
    }
}

// ─── HTTP backend ─────────────────────────────────────────────────────────────

/// HTTP client for the external language-model service.
///
/// One instance per process; the response cache lives in front of it.
pub struct HttpLlmClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl HttpLlmClient {
    pub fn new(endpoint: &str, model: &str, api_key: &str) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireContent>,
    usage: WireUsage,
    model: String,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: i64,
    output_tokens: i64,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate_raw(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let body = WireRequest {
            model: &self.model,
            system: &request.system_prompt,
            messages: vec![WireMessage {
                role: "user",
                content: &request.user_prompt,
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Service(status.as_u16(), text));
        }

        let wire: WireResponse = resp.json().await?;
        let content = wire
            .content
            .first()
            .map(|c| c.text.clone())
            .ok_or_else(|| LlmError::Malformed("empty content array".to_string()))?;

        debug!(
            model = %wire.model,
            prompt_tokens = wire.usage.input_tokens,
            completion_tokens = wire.usage.output_tokens,
            "model call complete"
        );

        Ok(LlmResponse {
            content,
            prompt_tokens: wire.usage.input_tokens,
            completion_tokens: wire.usage.output_tokens,
            total_tokens: wire.usage.input_tokens + wire.usage.output_tokens,
            model: wire.model,
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
