use async_trait::async_trait;
use futures::FutureExt;
use mercurial_browser::analysis::{
    AiBoundary, AiError, AnalysisKind, AnalysisLifecycle, AnalysisState, CitationSource,
    Classification, ContentAnalyzer, DispatchOutcome, ExtractResponse, Generation,
    GenerativeBackend, SummaryResponse,
};
use mercurial_browser::{BrowserConfig, BrowserError};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Holds every call until released, so tests can act while a request is
/// outstanding.
#[derive(Default)]
struct GatedAnalyzer {
    calls: AtomicUsize,
    release: Notify,
}

impl GatedAnalyzer {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn wait_for_calls(&self, n: usize) {
        while self.calls() < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl ContentAnalyzer for GatedAnalyzer {
    async fn summarize(&self, url: &str, _instruction: Option<&str>) -> SummaryResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        SummaryResponse {
            text: format!("Summary of {url}"),
            sources: vec![CitationSource::new(url, None)],
        }
    }

    async fn extract_text(&self, url: &str, _instruction: Option<&str>) -> ExtractResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        ExtractResponse {
            text: format!("Text of {url}"),
        }
    }
}

/// Answers immediately and records the instructions it was given.
struct CannedAnalyzer {
    summary: SummaryResponse,
    extract: ExtractResponse,
    instructions: Mutex<Vec<Option<String>>>,
}

impl CannedAnalyzer {
    fn new(text: &str, sources: Vec<CitationSource>) -> Self {
        Self {
            summary: SummaryResponse {
                text: text.to_string(),
                sources,
            },
            extract: ExtractResponse {
                text: text.to_string(),
            },
            instructions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ContentAnalyzer for CannedAnalyzer {
    async fn summarize(&self, _url: &str, instruction: Option<&str>) -> SummaryResponse {
        self.instructions.lock().push(instruction.map(str::to_string));
        self.summary.clone()
    }

    async fn extract_text(&self, _url: &str, instruction: Option<&str>) -> ExtractResponse {
        self.instructions.lock().push(instruction.map(str::to_string));
        self.extract.clone()
    }
}

struct PanickingAnalyzer;

#[async_trait]
impl ContentAnalyzer for PanickingAnalyzer {
    async fn summarize(&self, _url: &str, _instruction: Option<&str>) -> SummaryResponse {
        panic!("analyzer exploded")
    }

    async fn extract_text(&self, _url: &str, _instruction: Option<&str>) -> ExtractResponse {
        panic!("analyzer exploded")
    }
}

struct TimingOutBackend;

#[async_trait]
impl GenerativeBackend for TimingOutBackend {
    async fn generate(&self, _prompt: &str) -> Result<Generation, AiError> {
        Err(AiError::Timeout(Duration::from_secs(60)))
    }
}

#[tokio::test]
async fn test_second_dispatch_rejected_while_busy() {
    let analyzer = Arc::new(GatedAnalyzer::default());
    let lifecycle = AnalysisLifecycle::new(analyzer.clone());

    let (first, second) = tokio::join!(
        lifecycle.request_summary("https://x.test", None),
        async {
            analyzer.wait_for_calls(1).await;
            assert!(lifecycle.is_busy());
            let second = lifecycle.request_extraction("https://x.test", None).await;
            analyzer.release.notify_one();
            second
        }
    );

    assert_eq!(second, DispatchOutcome::Rejected);
    assert!(matches!(first, DispatchOutcome::Applied(ref r) if r.kind == AnalysisKind::Summary));
    assert_eq!(analyzer.calls(), 1);
    assert!(!lifecycle.is_busy());
}

#[tokio::test]
async fn test_result_for_previous_page_is_discarded() {
    let analyzer = Arc::new(GatedAnalyzer::default());
    let lifecycle = AnalysisLifecycle::new(analyzer.clone());

    let (outcome, ()) = tokio::join!(
        lifecycle.request_summary("https://old.test", None),
        async {
            analyzer.wait_for_calls(1).await;
            lifecycle.on_url_changed();
            // Still busy: the old request owns the slot until it returns.
            assert!(lifecycle.is_busy());
            analyzer.release.notify_one();
        }
    );

    assert_eq!(outcome, DispatchOutcome::Discarded);
    assert_eq!(lifecycle.state(), AnalysisState::Idle);
    assert_eq!(lifecycle.result(), None);

    // The slot is free again for the new page.
    analyzer.release.notify_one();
    let outcome = lifecycle.request_summary("https://new.test", None).await;
    let DispatchOutcome::Applied(result) = outcome else {
        panic!("expected applied outcome, got {outcome:?}");
    };
    assert_eq!(result.text, "Summary of https://new.test");
    assert_eq!(analyzer.calls(), 2);
}

#[tokio::test]
async fn test_abandoned_dispatch_frees_slot() {
    let analyzer = Arc::new(GatedAnalyzer::default());
    let lifecycle = AnalysisLifecycle::new(analyzer.clone());

    // Polled once, parked inside the analyzer, then dropped by the caller.
    assert!(lifecycle
        .request_summary("https://x.test", None)
        .now_or_never()
        .is_none());
    assert_eq!(analyzer.calls(), 1);

    assert!(!lifecycle.is_busy());
    assert_eq!(lifecycle.state(), AnalysisState::Idle);

    lifecycle.on_url_changed();
    analyzer.release.notify_one();
    let outcome = lifecycle.request_summary("https://y.test", None).await;
    let DispatchOutcome::Applied(result) = outcome else {
        panic!("expected applied outcome, got {outcome:?}");
    };
    assert_eq!(result.text, "Summary of https://y.test");
}

#[tokio::test]
async fn test_panicking_analyzer_frees_slot() {
    let lifecycle = AnalysisLifecycle::new(Arc::new(PanickingAnalyzer));

    let caught = AssertUnwindSafe(lifecycle.request_extraction("https://x.test", None))
        .catch_unwind()
        .await;

    assert!(caught.is_err());
    assert!(!lifecycle.is_busy());
    assert_eq!(lifecycle.state(), AnalysisState::Idle);
}

#[tokio::test]
async fn test_error_prefixed_responses_classify_as_error() {
    let analyzer = Arc::new(CannedAnalyzer::new(
        "Error: timeout",
        vec![CitationSource::new("https://leak.test", None)],
    ));
    let lifecycle = AnalysisLifecycle::new(analyzer);

    for kind in [AnalysisKind::Summary, AnalysisKind::ExtractedText] {
        let outcome = match kind {
            AnalysisKind::Summary => lifecycle.request_summary("https://x.test", None).await,
            AnalysisKind::ExtractedText => {
                lifecycle.request_extraction("https://x.test", None).await
            }
        };

        let DispatchOutcome::Applied(result) = outcome else {
            panic!("expected applied outcome, got {outcome:?}");
        };
        assert_eq!(result.kind, kind);
        assert_eq!(result.classification, Classification::Error);
        assert!(result.sources.is_empty());
        assert_eq!(lifecycle.copyable_text(), None);
    }
}

#[tokio::test]
async fn test_instructed_summary_keeps_sources() {
    let analyzer = Arc::new(CannedAnalyzer::new(
        "1. Foo\n2. Bar",
        vec![CitationSource::new("https://x.test", Some("X".to_string()))],
    ));
    let lifecycle = AnalysisLifecycle::new(analyzer.clone());

    let outcome = lifecycle
        .request_summary("https://news.test", Some("  list headlines "))
        .await;

    let DispatchOutcome::Applied(result) = outcome else {
        panic!("expected applied outcome, got {outcome:?}");
    };
    assert_eq!(result.classification, Classification::Ok);
    assert_eq!(result.sources.len(), 1);
    assert_eq!(result.sources[0].title, "X");
    assert_eq!(
        *analyzer.instructions.lock(),
        vec![Some("list headlines".to_string())]
    );
    assert_eq!(
        lifecycle.copyable_text(),
        Some("1. Foo\n2. Bar".to_string())
    );
}

#[tokio::test]
async fn test_boundary_failure_reaches_lifecycle_as_error() {
    let lifecycle = AnalysisLifecycle::new(Arc::new(AiBoundary::new(TimingOutBackend)));

    let outcome = lifecycle.request_summary("https://x.test", None).await;

    let DispatchOutcome::Applied(result) = outcome else {
        panic!("expected applied outcome, got {outcome:?}");
    };
    assert!(result.is_error());
    assert!(result.text.starts_with("Failed to analyze content."));
    assert!(result.text.contains("timed out"));
}

#[test]
fn test_config_from_json_fills_defaults() {
    let config = BrowserConfig::from_json(
        r#"{ "initial_url": "https://start.test", "analyzer": { "model": "gemini-2.0-pro" } }"#,
    )
    .unwrap();

    assert_eq!(config.initial_url, "https://start.test");
    assert_eq!(config.blank_url, "about:blank");
    assert_eq!(config.default_scheme, "https://");
    assert_eq!(config.analyzer.model, "gemini-2.0-pro");
    assert_eq!(config.analyzer.request_timeout_ms, 60_000);
}

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "default_scheme": "http://" }}"#).unwrap();

    let config = BrowserConfig::from_file(file.path()).unwrap();

    assert_eq!(config.default_scheme, "http://");
    assert_eq!(config.initial_url, BrowserConfig::default().initial_url);
}

#[test]
fn test_config_errors() {
    assert!(matches!(
        BrowserConfig::from_json("{ not json"),
        Err(BrowserError::Config(_))
    ));
    assert!(matches!(
        BrowserConfig::from_file("/nonexistent/mercurial.json"),
        Err(BrowserError::Io(_))
    ));
}
