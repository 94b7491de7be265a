//! OpenAI-compatible chat-completions client.
//!
//! Works against any server exposing `POST {base_url}/chat/completions`
//! with bearer authentication. HTTP status codes are mapped onto
//! [`ModelError`] so the evaluator can tell transient failures apart.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ModelClient, ModelError, ModelReply, ModelRequest};
use crate::config::ModelEndpoint;
use crate::domain::{SiftError, TokenUsage};

const MAX_ERROR_DETAIL: usize = 300;

/// Chat-completions client over `reqwest`.
pub struct OpenAiClient {
    http: reqwest::Client,
    completions_url: String,
    api_key: String,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("completions_url", &self.completions_url)
            .finish_non_exhaustive()
    }
}

impl OpenAiClient {
    /// Build a client. Fails if no API key is configured.
    pub fn new(endpoint: &ModelEndpoint) -> Result<Self, SiftError> {
        let api_key = endpoint
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                SiftError::MissingCredentials(
                    "no API key configured (set LLM_API_KEY or --api-key)".to_string(),
                )
            })?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("surveysift/", env!("CARGO_PKG_VERSION")))
            .timeout(endpoint.request_timeout())
            .build()
            .map_err(|e| SiftError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            completions_url: format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/')),
            api_key,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatReplyMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, request: ModelRequest) -> Result<ModelReply, ModelError> {
        let body = ChatRequest {
            model: &request.model,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
        };

        let response = self
            .http
            .post(&self.completions_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let text = response.text().await.map_err(transport_error)?;

        debug!(
            candidate = %request.correlation_id,
            status,
            bytes = text.len(),
            "model response received"
        );
        interpret_response(status, retry_after, &text, &request.model)
    }
}

fn transport_error(err: reqwest::Error) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout
    } else {
        ModelError::Transport(err.to_string())
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_DETAIL).collect()
}

/// Map an HTTP status and body to a reply or a typed error.
pub fn interpret_response(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
    requested_model: &str,
) -> Result<ModelReply, ModelError> {
    match status {
        200..=299 => {}
        401 | 403 => return Err(ModelError::Unauthorized { status }),
        408 => return Err(ModelError::Timeout),
        429 => return Err(ModelError::RateLimited { retry_after }),
        500..=599 => return Err(ModelError::Server { status }),
        _ => {
            return Err(ModelError::Rejected {
                status,
                detail: truncate(body),
            })
        }
    }

    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ModelError::InvalidResponse(format!("undecodable body: {e}")))?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::InvalidResponse("response has no choices".to_string()))?;

    let model = parsed.model.unwrap_or_else(|| requested_model.to_string());
    let usage = parsed
        .usage
        .map(|u| TokenUsage::new(model.clone(), u.prompt_tokens, u.completion_tokens));
    let refused = |detail: String| ModelError::Refused {
        detail,
        usage: usage.clone(),
    };

    if let Some(refusal) = choice.message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(refused(refusal));
    }
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(refused("reply blocked by content filter".to_string()));
    }
    let text = choice
        .message
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| refused("empty reply".to_string()))?;

    let usage = usage.unwrap_or_else(|| {
        warn!(model = %model, "response carried no usage block; counting zero tokens");
        TokenUsage::empty(model)
    });

    Ok(ModelReply { text, usage })
}
