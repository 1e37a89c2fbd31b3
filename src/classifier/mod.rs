use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod gemini;

pub use gemini::GeminiClassifier;

pub const JSON_MIME_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRequest {
    pub prompt: String,
    pub response_mime_type: String,
}

impl ClassificationRequest {
    /// A request asking the service for JSON-typed output.
    pub fn json(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            response_mime_type: JSON_MIME_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub candidate_tokens: u64,
    pub total_tokens: u64,
}

/// What the service returned after JSON decoding. `parsed_result` is not
/// checked against any schema here.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassifierOutput {
    pub parsed_result: Option<Value>,
    pub token_usage: TokenUsage,
}

/// The external generative-text service.
#[async_trait(?Send)]
pub trait Classifier {
    fn name(&self) -> &str;

    async fn classify(&self, request: &ClassificationRequest) -> Result<ClassifierOutput>;
}
