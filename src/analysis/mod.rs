//! AI page analysis: request lifecycle and result state.
//!
//! One request may be outstanding at a time across both kinds. Every dispatch
//! and every URL change bumps a generation counter; a response whose
//! generation no longer matches is dropped instead of being shown against a
//! page it was not asked about.

pub mod boundary;
#[cfg(feature = "gemini")]
pub mod gemini;

pub use boundary::{
    AiBoundary, AiError, ContentAnalyzer, ExtractResponse, Generation, GenerativeBackend,
    GroundingChunk, SummaryResponse,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Prefixes the boundary uses for failures folded into response text.
pub const FAILURE_MARKERS: [&str; 2] = ["Failed", "Error:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisKind {
    Summary,
    ExtractedText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Ok,
    Error,
}

pub fn classify_response(text: &str) -> Classification {
    if FAILURE_MARKERS.iter().any(|marker| text.starts_with(marker)) {
        Classification::Error
    } else {
        Classification::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationSource {
    pub uri: String,
    pub title: String,
}

impl CitationSource {
    pub fn new(uri: impl Into<String>, title: Option<String>) -> Self {
        let uri = uri.into();
        let title = title.filter(|t| !t.is_empty()).unwrap_or_else(|| uri.clone());
        Self { uri, title }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisResult {
    pub kind: AnalysisKind,
    pub text: String,
    pub classification: Classification,
    pub sources: Vec<CitationSource>,
}

impl AnalysisResult {
    pub fn from_summary(response: SummaryResponse) -> Self {
        let classification = classify_response(&response.text);
        let sources = match classification {
            Classification::Ok => response.sources,
            Classification::Error => Vec::new(),
        };
        Self {
            kind: AnalysisKind::Summary,
            text: response.text,
            classification,
            sources,
        }
    }

    pub fn from_extraction(response: ExtractResponse) -> Self {
        Self {
            kind: AnalysisKind::ExtractedText,
            classification: classify_response(&response.text),
            text: response.text,
            sources: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.classification == Classification::Error
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum AnalysisState {
    Idle,
    InFlight { kind: AnalysisKind },
    Resolved(AnalysisResult),
}

/// What became of a dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied(AnalysisResult),
    /// The response arrived after the page or request changed.
    Discarded,
    /// Another request was already in flight; nothing was sent.
    Rejected,
}

#[derive(Debug)]
struct Slot {
    state: AnalysisState,
    generation: u64,
    instruction: String,
}

impl Slot {
    fn is_busy(&self) -> bool {
        matches!(self.state, AnalysisState::InFlight { .. })
    }
}

pub struct AnalysisLifecycle {
    analyzer: Arc<dyn ContentAnalyzer>,
    slot: Mutex<Slot>,
}

impl AnalysisLifecycle {
    pub fn new(analyzer: Arc<dyn ContentAnalyzer>) -> Self {
        Self {
            analyzer,
            slot: Mutex::new(Slot {
                state: AnalysisState::Idle,
                generation: 0,
                instruction: String::new(),
            }),
        }
    }

    pub async fn request_summary(&self, url: &str, instruction: Option<&str>) -> DispatchOutcome {
        self.dispatch(AnalysisKind::Summary, url, instruction).await
    }

    pub async fn request_extraction(
        &self,
        url: &str,
        instruction: Option<&str>,
    ) -> DispatchOutcome {
        self.dispatch(AnalysisKind::ExtractedText, url, instruction)
            .await
    }

    /// Claims the slot for one request of `kind`, or `None` while another is
    /// in flight. The claim is released when the returned reservation is run
    /// to completion or dropped.
    pub fn try_reserve(&self, kind: AnalysisKind) -> Option<Reservation<'_>> {
        let mut slot = self.slot.lock();
        if slot.is_busy() {
            debug!(?kind, "analysis already in flight, rejecting dispatch");
            return None;
        }
        slot.generation += 1;
        slot.state = AnalysisState::InFlight { kind };
        Some(Reservation {
            lifecycle: self,
            kind,
            generation: slot.generation,
            settled: false,
        })
    }

    /// Drops the shown result and the pending instruction. A request still in
    /// flight keeps the lifecycle busy but its response will be discarded.
    pub fn on_url_changed(&self) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.instruction.clear();
        if !slot.is_busy() {
            slot.state = AnalysisState::Idle;
        }
        debug!(generation = slot.generation, "analysis invalidated by url change");
    }

    pub fn set_instruction(&self, instruction: impl Into<String>) {
        self.slot.lock().instruction = instruction.into();
    }

    pub fn instruction(&self) -> String {
        self.slot.lock().instruction.clone()
    }

    pub fn state(&self) -> AnalysisState {
        self.slot.lock().state.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.slot.lock().is_busy()
    }

    pub fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    pub fn result(&self) -> Option<AnalysisResult> {
        match &self.slot.lock().state {
            AnalysisState::Resolved(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// Text offered for copying; error output is never offered.
    pub fn copyable_text(&self) -> Option<String> {
        self.result()
            .filter(|result| !result.is_error())
            .map(|result| result.text)
    }

    /// Sources as listed in the panel: the analyzed page first, then the
    /// citations. Empty when there is nothing to cite or the result is an error.
    pub fn display_sources(&self, current_url: &str) -> Vec<CitationSource> {
        let Some(result) = self.result() else {
            return Vec::new();
        };
        if result.is_error() || result.sources.is_empty() {
            return Vec::new();
        }

        let mut sources = Vec::with_capacity(result.sources.len() + 1);
        sources.push(CitationSource::new(current_url, Some("Original URL".to_string())));
        sources.extend(result.sources);
        sources
    }

    async fn dispatch(
        &self,
        kind: AnalysisKind,
        url: &str,
        instruction: Option<&str>,
    ) -> DispatchOutcome {
        match self.try_reserve(kind) {
            Some(reservation) => reservation.run(url, instruction).await,
            None => DispatchOutcome::Rejected,
        }
    }
}

/// A claimed analysis slot. Dropping it before [`Reservation::run`] finishes
/// (the caller gave up on the future, or the analyzer panicked) frees the slot.
#[must_use = "the slot stays claimed until the reservation is run or dropped"]
pub struct Reservation<'a> {
    lifecycle: &'a AnalysisLifecycle,
    kind: AnalysisKind,
    generation: u64,
    settled: bool,
}

impl Reservation<'_> {
    pub fn kind(&self) -> AnalysisKind {
        self.kind
    }

    pub async fn run(mut self, url: &str, instruction: Option<&str>) -> DispatchOutcome {
        let lifecycle = self.lifecycle;
        let kind = self.kind;
        let generation = self.generation;
        let instruction = instruction.map(str::trim).filter(|s| !s.is_empty());
        info!(?kind, %url, generation, "dispatching analysis");

        let analyzer = &lifecycle.analyzer;
        let result = match kind {
            AnalysisKind::Summary => {
                AnalysisResult::from_summary(analyzer.summarize(url, instruction).await)
            }
            AnalysisKind::ExtractedText => {
                AnalysisResult::from_extraction(analyzer.extract_text(url, instruction).await)
            }
        };

        let mut slot = lifecycle.slot.lock();
        self.settled = true;
        if slot.generation != generation {
            slot.state = AnalysisState::Idle;
            debug!(
                ?kind,
                generation,
                current = slot.generation,
                "discarding stale analysis result"
            );
            return DispatchOutcome::Discarded;
        }

        info!(?kind, classification = ?result.classification, sources = result.sources.len(), "analysis resolved");
        slot.state = AnalysisState::Resolved(result.clone());
        DispatchOutcome::Applied(result)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut slot = self.lifecycle.slot.lock();
        if slot.is_busy() {
            slot.state = AnalysisState::Idle;
        }
        debug!(kind = ?self.kind, generation = self.generation, "analysis abandoned before completion");
    }
}
