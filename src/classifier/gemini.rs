use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ClassificationRequest, Classifier, ClassifierOutput, TokenUsage};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const API_BASE_ENV: &str = "TRIAGE_GEMINI_API_BASE";
const API_KEY_HEADER: &str = "x-goog-api-key";
const REDACTED_BODY_MAX_LEN: usize = 200;

/// `generateContent` client for the Gemini API.
#[derive(Debug, Clone)]
pub struct GeminiClassifier {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl GeminiClassifier {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let api_base = std::env::var(API_BASE_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| GEMINI_API_BASE.to_string());
        Self::with_api_base(api_key, model, api_base)
    }

    pub fn with_api_base(
        api_key: impl Into<String>,
        model: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> Result<Url> {
        let model = self.model.trim_start_matches("models/");
        let raw = format!("{}/models/{model}:generateContent", self.api_base);
        Url::parse(&raw).with_context(|| format!("build gemini url for model {model}"))
    }
}

#[async_trait(?Send)]
impl Classifier for GeminiClassifier {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<ClassifierOutput> {
        let body = request_body(request);
        let response = self
            .client
            .post(self.endpoint()?)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("gemini generateContent request ({})", self.model))?;

        let status = response.status();
        let text = response.text().await.context("read gemini response body")?;
        if !status.is_success() {
            return Err(anyhow!(
                "gemini request failed: status={} body={}",
                status,
                truncate(&text)
            ));
        }

        let decoded: GenerateContentResponse =
            serde_json::from_str(&text).context("decode gemini response JSON")?;
        let output = decoded.into_output();
        debug!(
            model = %self.model,
            total_tokens = output.token_usage.total_tokens,
            "gemini classification returned"
        );
        Ok(output)
    }
}

fn request_body(request: &ClassificationRequest) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": request.prompt }]
        }],
        "generationConfig": {
            "response_mime_type": request.response_mime_type
        }
    })
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(REDACTED_BODY_MAX_LEN) {
        Some((cut, _)) => format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len()),
        None => trimmed.to_string(),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Clone, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Clone, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

impl GenerateContentResponse {
    /// Text of the first candidate, JSON-decoded when possible. Text that is
    /// not JSON is passed through as a string value.
    fn into_output(self) -> ClassifierOutput {
        let text = self
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .filter(|text| !text.trim().is_empty());

        let parsed_result =
            text.map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text)));
        let usage = self.usage_metadata.unwrap_or_default();

        ClassifierOutput {
            parsed_result,
            token_usage: TokenUsage {
                prompt_tokens: usage.prompt_token_count,
                candidate_tokens: usage.candidates_token_count,
                total_tokens: usage.total_token_count,
            },
        }
    }
}
