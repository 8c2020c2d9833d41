//! Gemini `generateContent` client with Google Search grounding.

use super::boundary::{AiError, Generation, GenerativeBackend, GroundingChunk};
use crate::{AnalyzerConfig, BrowserError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

pub struct GeminiClient {
    client: Client,
    url: Url,
    api_key: String,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(config: &AnalyzerConfig) -> crate::Result<Self> {
        let api_key = config.resolve_api_key()?;
        let url = generate_content_url(&config.endpoint, &config.model)?;
        let timeout = Duration::from_millis(config.request_timeout_ms);

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("Mercurial/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BrowserError::Analyzer(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url,
            api_key,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl GenerativeBackend for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<Generation, AiError> {
        let body = GenerateContentRequest::grounded(prompt);
        debug!(endpoint = %self.url, prompt_len = prompt.len(), "sending generateContent request");

        let response = self
            .client
            .post(self.url.clone())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiError::Timeout(self.timeout)
                } else {
                    AiError::Http(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AiError::Http(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(api_error(status, &bytes));
        }
        parse_generate_response(&bytes)
    }
}

pub fn generate_content_url(endpoint: &str, model: &str) -> crate::Result<Url> {
    let base = endpoint.trim_end_matches('/');
    Url::parse(&format!("{base}/models/{model}:generateContent"))
        .map_err(|e| BrowserError::Config(format!("invalid analyzer endpoint {endpoint:?}: {e}")))
}

#[derive(Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    tools: Vec<Tool>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Tool {
    google_search: GoogleSearch,
}

#[derive(Serialize)]
struct GoogleSearch {}

impl<'a> GenerateContentRequest<'a> {
    fn grounded(prompt: &'a str) -> Self {
        Self {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
            tools: vec![Tool {
                google_search: GoogleSearch {},
            }],
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct GenerateContentResponse {
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct Candidate {
    content: Option<CandidateContent>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CandidateContent {
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct GroundingMetadata {
    grounding_chunks: Vec<WireChunk>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireChunk {
    web: Option<GroundingChunk>,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

fn parse_generate_response(bytes: &[u8]) -> Result<Generation, AiError> {
    let response: GenerateContentResponse =
        serde_json::from_slice(bytes).map_err(|e| AiError::Decode(e.to_string()))?;

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or(AiError::EmptyResponse)?;

    let text = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<String>()
        })
        .unwrap_or_default();

    let grounding = candidate
        .grounding_metadata
        .map(|meta| {
            meta.grounding_chunks
                .into_iter()
                .filter_map(|chunk| chunk.web)
                .collect()
        })
        .unwrap_or_default();

    Ok(Generation { text, grounding })
}

fn api_error(status: u16, bytes: &[u8]) -> AiError {
    let message = serde_json::from_slice::<ApiErrorEnvelope>(bytes)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(bytes).trim().to_string());
    AiError::Api { status, message }
}
