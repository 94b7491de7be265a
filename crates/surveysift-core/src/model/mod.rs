//! The seam between the evaluator and the remote model API.
//!
//! # Modules
//!
//! - [`openai`]: `OpenAiClient`, an OpenAI-compatible chat-completions client
//!
//! Tests inject [`crate::fakes::FakeModel`] through the same trait.

pub mod openai;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::TokenUsage;

pub use openai::OpenAiClient;

/// One classification request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    /// Local correlation tag (the candidate id). Never sent to the API.
    pub correlation_id: String,
}

/// A successful model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub usage: TokenUsage,
}

/// Failures of a single model call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("model call timed out")]
    Timeout,

    #[error("rate limited by model API")]
    RateLimited { retry_after: Option<Duration> },

    #[error("model API server error (HTTP {status})")]
    Server { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    /// The call completed and was billed, but carried no usable answer.
    #[error("model refused to answer: {detail}")]
    Refused {
        detail: String,
        usage: Option<TokenUsage>,
    },

    #[error("request rejected (HTTP {status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("malformed API response: {0}")]
    InvalidResponse(String),

    #[error("credentials rejected (HTTP {status})")]
    Unauthorized { status: u16 },
}

impl ModelError {
    /// A refusal with no usage attached.
    pub fn refused(detail: impl Into<String>) -> Self {
        Self::Refused {
            detail: detail.into(),
            usage: None,
        }
    }

    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited { .. } | Self::Server { .. } | Self::Transport(_)
        )
    }

    /// Affects every request, so the whole run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Server-requested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A remote language model that answers one prompt at a time.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelReply, ModelError>;
}
