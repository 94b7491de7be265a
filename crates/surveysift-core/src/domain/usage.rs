use serde::{Deserialize, Serialize};

/// Tokens consumed by one model call attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub model: String,
}

impl TokenUsage {
    /// Build a usage record; `total_tokens` is derived.
    pub fn new(model: impl Into<String>, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            model: model.into(),
        }
    }

    /// Zero usage attributed to `model`.
    pub fn empty(model: impl Into<String>) -> Self {
        Self::new(model, 0, 0)
    }

    /// Sum of several attempts. The model id of the last attempt wins.
    pub fn sum<'a>(model: &str, usages: impl IntoIterator<Item = &'a TokenUsage>) -> Self {
        usages
            .into_iter()
            .fold(Self::empty(model), |mut acc, u| {
                acc.prompt_tokens += u.prompt_tokens;
                acc.completion_tokens += u.completion_tokens;
                acc.total_tokens += u.total_tokens;
                acc.model = u.model.clone();
                acc
            })
    }
}
