//! Bridges the embedded view and the history store.
//!
//! The view is the source of truth for what actually loaded: when it lands
//! somewhere other than the current entry (a link followed inside the frame,
//! a server redirect) the entry under the cursor is rewritten in place.

pub mod view;

pub use view::{
    ContentView, FrameAccessError, HeadlessView, SubscriptionId, ViewEvent, ViewEventSender,
};

use crate::core::history::HistoryStore;
use crate::BrowserConfig;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Loading cleared, current entry kept.
    Settled,
    /// Loading cleared and the current entry now holds `url`.
    Reconciled { url: String },
    /// Loading cleared; the view would not say where it ended up.
    Unreadable,
    /// Completion for a load that has since been superseded.
    Stale,
}

#[derive(Debug, Clone)]
pub struct NavigationController {
    blank_url: String,
    default_scheme: String,
}

impl NavigationController {
    pub fn new(config: &BrowserConfig) -> Self {
        Self {
            blank_url: config.blank_url.clone(),
            default_scheme: config.default_scheme.clone(),
        }
    }

    /// Turns URL-bar input into a navigable URL. Input without an `http(s)://`
    /// scheme gets the default scheme; blank input yields nothing.
    pub fn normalize_input(&self, input: &str) -> Option<String> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }
        if has_web_scheme(trimmed) {
            Some(trimmed.to_string())
        } else {
            Some(format!("{}{}", self.default_scheme, trimmed))
        }
    }

    pub fn on_load_complete(
        &self,
        history: &mut HistoryStore,
        token: u64,
        resolved_url: Result<String, FrameAccessError>,
    ) -> LoadOutcome {
        if token != history.load_token() {
            trace!(token, current = history.load_token(), "ignoring superseded load completion");
            return LoadOutcome::Stale;
        }

        history.mark_loaded();

        let url = match resolved_url {
            Ok(url) => url,
            Err(err) => {
                trace!(%err, "frame location unreadable");
                return LoadOutcome::Unreadable;
            }
        };

        if url.is_empty() || url == self.blank_url || url == history.current_url() {
            return LoadOutcome::Settled;
        }

        if history.reconcile_external_url(url.clone()) {
            debug!(%url, cursor = history.cursor(), "reconciled history with view location");
            LoadOutcome::Reconciled { url }
        } else {
            LoadOutcome::Settled
        }
    }

    /// Registers for the view's load events. The registration lives exactly as
    /// long as the returned guard.
    pub fn subscribe(&self, view: Arc<dyn ContentView>) -> LoadSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = view.subscribe(tx);
        debug!(id = id.0, "subscribed to view load events");
        LoadSubscription {
            id,
            view,
            events: rx,
        }
    }
}

impl Default for NavigationController {
    fn default() -> Self {
        Self::new(&BrowserConfig::default())
    }
}

fn has_web_scheme(input: &str) -> bool {
    ["http://", "https://"].iter().any(|scheme| {
        input
            .get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
    })
}

pub struct LoadSubscription {
    id: SubscriptionId,
    view: Arc<dyn ContentView>,
    events: mpsc::UnboundedReceiver<ViewEvent>,
}

impl LoadSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn try_next(&mut self) -> Option<ViewEvent> {
        self.events.try_recv().ok()
    }

    pub async fn next(&mut self) -> Option<ViewEvent> {
        self.events.recv().await
    }

    pub fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<ViewEvent>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for LoadSubscription {
    fn drop(&mut self) {
        self.view.unsubscribe(self.id);
        debug!(id = self.id.0, "unsubscribed from view load events");
    }
}
