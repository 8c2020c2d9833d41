//! Mercurial browser session core (single-thread async friendly)
//!
//! Notes for the host:
//!  - The session is built to run on a single-thread Tokio runtime:
//!    `#[tokio::main(flavor = "current_thread")] async fn main() { /* ... */ }`
//!  - Navigation and analysis are separate async calls on one shared
//!    `BrowserSession`; drive them concurrently with `tokio::join!` or
//!    `spawn_local` rather than from several OS threads.
//!  - No lock is held across the AI round-trip, so navigating while an analysis
//!    is in flight never waits on it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::poll_fn;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

pub mod analysis;
pub mod core;

use crate::analysis::{
    AnalysisKind, AnalysisLifecycle, AnalysisState, CitationSource, Classification,
    ContentAnalyzer, DispatchOutcome,
};
use crate::core::{
    history::{HistoryStore, LoadCommand, BLANK_URL},
    navigation::{ContentView, LoadOutcome, LoadSubscription, NavigationController, ViewEvent},
};

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Analyzer error: {0}")]
    Analyzer(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for BrowserError {
    fn from(e: serde_json::Error) -> Self {
        BrowserError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrowserError>;

/// Environment variables consulted for the analyzer key, in order.
pub const API_KEY_VARS: [&str; 2] = ["API_KEY", "GEMINI_API_KEY"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub request_timeout_ms: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemini-2.5-flash".to_string(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            request_timeout_ms: 60_000,
        }
    }
}

impl AnalyzerConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            api_key: api_key_from_env(),
            ..Self::default()
        };
        config.resolve_api_key()?;
        Ok(config)
    }

    /// The configured key, or the first non-empty key found in the environment.
    pub fn resolve_api_key(&self) -> Result<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(api_key_from_env)
            .ok_or_else(|| {
                BrowserError::Config(format!(
                    "no analyzer API key configured; set one of {}",
                    API_KEY_VARS.join(", ")
                ))
            })
    }
}

fn api_key_from_env() -> Option<String> {
    API_KEY_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|key| !key.trim().is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub initial_url: String,
    /// Location the view reports for an empty document; never written to history.
    pub blank_url: String,
    /// Prepended to URL-bar input that carries no `http(s)://` scheme.
    pub default_scheme: String,
    pub analyzer: AnalyzerConfig,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            initial_url: "https://en.wikipedia.org/wiki/Cyberpunk".to_string(),
            blank_url: BLANK_URL.to_string(),
            default_scheme: "https://".to_string(),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

impl BrowserConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserEvent {
    NavigationStarted {
        url: String,
        token: u64,
        reload: bool,
    },
    PageLoaded {
        url: String,
    },
    UrlReconciled {
        url: String,
    },
    AnalysisResolved {
        kind: AnalysisKind,
        classification: Classification,
    },
    AnalysisDiscarded {
        kind: AnalysisKind,
    },
    AnalysisRejected {
        kind: AnalysisKind,
    },
}

/// Everything the chrome needs to draw one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub current_url: String,
    pub history: Vec<String>,
    pub cursor: usize,
    pub can_go_back: bool,
    pub can_go_forward: bool,
    pub is_loading: bool,
    pub load_token: u64,
    pub panel_open: bool,
    pub instruction: String,
    pub analysis: AnalysisState,
    pub sources: Vec<CitationSource>,
    pub copyable: Option<String>,
}

/// One browser window: history, the embedded view it drives, and the
/// analysis panel. Owned by the caller; nothing here is global.
pub struct BrowserSession {
    id: Uuid,
    config: BrowserConfig,
    history: RwLock<HistoryStore>,
    controller: NavigationController,
    analysis: AnalysisLifecycle,
    view: Arc<dyn ContentView>,
    subscription: Mutex<LoadSubscription>,
    panel_open: RwLock<bool>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<BrowserEvent>>>,
}

impl BrowserSession {
    // -------- Construction --------

    /// Subscribes to `view` and issues the initial load.
    pub fn new(
        config: BrowserConfig,
        view: Arc<dyn ContentView>,
        analyzer: Arc<dyn ContentAnalyzer>,
    ) -> Self {
        let history =
            HistoryStore::new(config.initial_url.clone()).with_blank_url(config.blank_url.clone());
        let controller = NavigationController::new(&config);
        let subscription = controller.subscribe(view.clone());
        let id = Uuid::new_v4();

        let initial = history.load_command();
        info!(session = %id, url = %initial.url, "starting browser session");
        view.load(&initial);

        Self {
            id,
            config,
            history: RwLock::new(history),
            controller,
            analysis: AnalysisLifecycle::new(analyzer),
            view,
            subscription: Mutex::new(subscription),
            panel_open: RwLock::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Session backed by the Gemini API, keyed from config or the environment.
    #[cfg(feature = "gemini")]
    pub fn with_gemini(config: BrowserConfig, view: Arc<dyn ContentView>) -> Result<Self> {
        let client = crate::analysis::gemini::GeminiClient::new(&config.analyzer)?;
        let analyzer = Arc::new(crate::analysis::AiBoundary::new(client));
        Ok(Self::new(config, view, analyzer))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<BrowserEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    // -------- Navigation --------

    /// URL-bar submission. Blank input is ignored.
    pub async fn submit_url(&self, input: &str) -> bool {
        match self.controller.normalize_input(input) {
            Some(url) => self.navigate(&url).await,
            None => false,
        }
    }

    pub async fn navigate(&self, url: &str) -> bool {
        let command = {
            let mut history = self.history.write().await;
            if !history.navigate(url) {
                return false;
            }
            history.load_command()
        };
        self.start_load(command, true);
        true
    }

    pub async fn go_back(&self) -> bool {
        let command = {
            let mut history = self.history.write().await;
            if !history.go_back() {
                return false;
            }
            history.load_command()
        };
        self.start_load(command, true);
        true
    }

    pub async fn go_forward(&self) -> bool {
        let command = {
            let mut history = self.history.write().await;
            if !history.go_forward() {
                return false;
            }
            history.load_command()
        };
        self.start_load(command, true);
        true
    }

    pub async fn refresh(&self) {
        let command = {
            let mut history = self.history.write().await;
            history.refresh();
            history.load_command()
        };
        self.start_load(command, false);
    }

    /// Handles every view event already queued. Returns how many were handled.
    pub async fn pump_view_events(&self) -> usize {
        let mut handled = 0;
        loop {
            let event = self.subscription.lock().try_next();
            match event {
                Some(event) => {
                    self.handle_view_event(event).await;
                    handled += 1;
                }
                None => return handled,
            }
        }
    }

    /// Waits for the next view event and handles it. Returns false once the
    /// view has gone away. The subscription is only locked while polled, so
    /// `pump_view_events` never waits behind this; keep to one waiter at a time.
    pub async fn wait_for_view_event(&self) -> bool {
        let event = poll_fn(|cx| self.subscription.lock().poll_next(cx)).await;
        match event {
            Some(event) => {
                self.handle_view_event(event).await;
                true
            }
            None => false,
        }
    }

    pub async fn handle_view_event(&self, event: ViewEvent) {
        match event {
            ViewEvent::LoadComplete {
                token,
                resolved_url,
            } => {
                let (outcome, current) = {
                    let mut history = self.history.write().await;
                    let outcome = self
                        .controller
                        .on_load_complete(&mut history, token, resolved_url);
                    (outcome, history.current_url().to_string())
                };

                match outcome {
                    LoadOutcome::Stale => return,
                    LoadOutcome::Reconciled { url } => {
                        self.emit(BrowserEvent::UrlReconciled { url });
                        self.analysis.on_url_changed();
                    }
                    LoadOutcome::Settled | LoadOutcome::Unreadable => {}
                }
                self.emit(BrowserEvent::PageLoaded { url: current });
            }
        }
    }

    pub async fn current_url(&self) -> String {
        self.history.read().await.current_url().to_string()
    }

    pub async fn history_urls(&self) -> Vec<String> {
        let history = self.history.read().await;
        history.urls().into_iter().map(str::to_string).collect()
    }

    pub async fn can_go_back(&self) -> bool {
        self.history.read().await.can_go_back()
    }

    pub async fn can_go_forward(&self) -> bool {
        self.history.read().await.can_go_forward()
    }

    pub async fn is_loading(&self) -> bool {
        self.history.read().await.is_loading()
    }

    // -------- Analysis panel --------

    pub async fn set_instruction(&self, instruction: &str) {
        self.analysis.set_instruction(instruction);
    }

    pub async fn request_summary(&self) -> DispatchOutcome {
        self.request(AnalysisKind::Summary).await
    }

    pub async fn request_extraction(&self) -> DispatchOutcome {
        self.request(AnalysisKind::ExtractedText).await
    }

    pub fn analysis(&self) -> &AnalysisLifecycle {
        &self.analysis
    }

    pub async fn toggle_panel(&self) -> bool {
        let mut open = self.panel_open.write().await;
        *open = !*open;
        *open
    }

    pub async fn close_panel(&self) {
        *self.panel_open.write().await = false;
    }

    pub async fn is_panel_open(&self) -> bool {
        *self.panel_open.read().await
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let (current_url, history_urls, cursor, can_go_back, can_go_forward, is_loading, load_token) =
        {
            let history = self.history.read().await;
            (
                history.current_url().to_string(),
                history
                    .urls()
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
                history.cursor(),
                history.can_go_back(),
                history.can_go_forward(),
                history.is_loading(),
                history.load_token(),
            )
        };

        SessionSnapshot {
            session_id: self.id,
            sources: self.analysis.display_sources(&current_url),
            current_url,
            history: history_urls,
            cursor,
            can_go_back,
            can_go_forward,
            is_loading,
            load_token,
            panel_open: self.is_panel_open().await,
            instruction: self.analysis.instruction(),
            analysis: self.analysis.state(),
            copyable: self.analysis.copyable_text(),
        }
    }

    // -------- Internals --------

    async fn request(&self, kind: AnalysisKind) -> DispatchOutcome {
        // The slot is claimed while history is read-locked, so any URL change
        // lands after the claim and bumps its generation.
        let claimed = {
            let history = self.history.read().await;
            self.analysis.try_reserve(kind).map(|reservation| {
                (
                    reservation,
                    history.current_url().to_string(),
                    self.analysis.instruction(),
                )
            })
        };

        let outcome = match claimed {
            Some((reservation, url, instruction)) => {
                let instruction = Some(instruction.as_str()).filter(|s| !s.trim().is_empty());
                reservation.run(&url, instruction).await
            }
            None => DispatchOutcome::Rejected,
        };

        match &outcome {
            DispatchOutcome::Applied(result) => self.emit(BrowserEvent::AnalysisResolved {
                kind,
                classification: result.classification,
            }),
            DispatchOutcome::Discarded => self.emit(BrowserEvent::AnalysisDiscarded { kind }),
            DispatchOutcome::Rejected => self.emit(BrowserEvent::AnalysisRejected { kind }),
        }
        outcome
    }

    fn start_load(&self, command: LoadCommand, url_changed: bool) {
        self.view.load(&command);
        self.emit(BrowserEvent::NavigationStarted {
            url: command.url,
            token: command.token,
            reload: command.reload,
        });
        if url_changed {
            self.analysis.on_url_changed();
        }
    }

    fn emit(&self, event: BrowserEvent) {
        debug!(session = %self.id, ?event, "browser event");
        self.listeners
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
