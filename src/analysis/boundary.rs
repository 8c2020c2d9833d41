//! The seam between the session and the generative-AI service.
//!
//! [`ContentAnalyzer`] is what the lifecycle consumes: it never fails, a
//! failure arrives as text starting with a marker. [`AiBoundary`] produces that
//! contract on top of any fallible [`GenerativeBackend`], catching errors and
//! panics on the way.

use super::CitationSource;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

const SUMMARY_FAILURE: &str =
    "Failed to analyze content. The AI core might be offline or the URL is inaccessible. ";
const EXTRACTION_FAILURE: &str =
    "Failed to fetch page content. The AI core might be offline or the URL is inaccessible. ";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SummaryResponse {
    pub text: String,
    pub sources: Vec<CitationSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractResponse {
    pub text: String,
}

#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn summarize(&self, url: &str, instruction: Option<&str>) -> SummaryResponse;
    async fn extract_text(&self, url: &str, instruction: Option<&str>) -> ExtractResponse;
}

/// A web source the model grounded its answer on. Either field may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct GroundingChunk {
    pub uri: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Generation {
    pub text: String,
    pub grounding: Vec<GroundingChunk>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AiError {
    #[error("HTTP transport failed: {0}")]
    Http(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("response contained no candidates")]
    EmptyResponse,
}

#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<Generation, AiError>;
}

pub fn summary_prompt(url: &str, instruction: Option<&str>) -> String {
    let base = format!("Regarding the content at the URL: {url}.");
    match instruction {
        Some(instruction) => {
            format!("{base} Please follow this specific instruction: \"{instruction}\".")
        }
        None => format!(
            "{base} Provide a concise summary of the content, identifying key topics and main points."
        ),
    }
}

pub fn extraction_prompt(url: &str, instruction: Option<&str>) -> String {
    match instruction {
        Some(instruction) => format!(
            "From the URL {url}, extract the text content based on the following instruction: \
             \"{instruction}\". Do not summarize it. Return only the extracted text. \
             Do not add any introductory phrases."
        ),
        None => format!(
            "Extract the full text content from the main article or body of the URL: {url}. \
             Do not summarize it. Return only the text content. Do not add any introductory \
             phrases like \"Here is the text content:\"."
        ),
    }
}

/// Keeps chunks that name a URI; a missing title falls back to the URI.
pub fn citation_sources(chunks: Vec<GroundingChunk>) -> Vec<CitationSource> {
    chunks
        .into_iter()
        .filter_map(|chunk| {
            let uri = chunk.uri.filter(|uri| !uri.is_empty())?;
            Some(CitationSource::new(uri, chunk.title))
        })
        .collect()
}

pub struct AiBoundary<B> {
    backend: B,
}

impl<B: GenerativeBackend> AiBoundary<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn guarded_generate(&self, prompt: &str) -> Result<Generation, String> {
        match AssertUnwindSafe(self.backend.generate(prompt))
            .catch_unwind()
            .await
        {
            Ok(Ok(generation)) => Ok(generation),
            Ok(Err(err)) => {
                warn!(%err, "generative backend failed");
                Err(err.to_string())
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                error!(%msg, "generative backend panicked");
                Err(format!("panic caught: {msg}"))
            }
        }
    }
}

#[async_trait]
impl<B: GenerativeBackend> ContentAnalyzer for AiBoundary<B> {
    async fn summarize(&self, url: &str, instruction: Option<&str>) -> SummaryResponse {
        let prompt = summary_prompt(url, instruction);
        debug!(%url, instructed = instruction.is_some(), "requesting summary");
        match self.guarded_generate(&prompt).await {
            Ok(generation) => SummaryResponse {
                text: generation.text,
                sources: citation_sources(generation.grounding),
            },
            Err(detail) => SummaryResponse {
                text: format!("{SUMMARY_FAILURE}{detail}"),
                sources: Vec::new(),
            },
        }
    }

    async fn extract_text(&self, url: &str, instruction: Option<&str>) -> ExtractResponse {
        let prompt = extraction_prompt(url, instruction);
        debug!(%url, instructed = instruction.is_some(), "requesting text extraction");
        match self.guarded_generate(&prompt).await {
            Ok(generation) => ExtractResponse {
                text: generation.text,
            },
            Err(detail) => ExtractResponse {
                text: format!("{EXTRACTION_FAILURE}{detail}"),
            },
        }
    }
}
