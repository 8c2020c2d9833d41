use crate::core::history::LoadCommand;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Why the view could not report the location it ended up on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameAccessError {
    #[error("cross-origin frame location is not readable")]
    CrossOrigin,
    #[error("frame has no document")]
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    /// The load started by the command carrying `token` finished.
    LoadComplete {
        token: u64,
        resolved_url: Result<String, FrameAccessError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub type ViewEventSender = mpsc::UnboundedSender<ViewEvent>;

/// The embedded content surface. Rendering is its own business; the session
/// only tells it what to load and listens for completion.
pub trait ContentView: Send + Sync {
    fn load(&self, command: &LoadCommand);
    fn subscribe(&self, events: ViewEventSender) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Number of recent load commands a [`HeadlessView`] remembers.
pub const LOAD_LOG_CAPACITY: usize = 32;

/// View without a rendering surface. Loads are recorded and completed on
/// demand, which is what the terminal shell and the tests drive. Only the
/// most recent [`LOAD_LOG_CAPACITY`] commands are kept.
#[derive(Default)]
pub struct HeadlessView {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, ViewEventSender>>,
    loads: Mutex<VecDeque<LoadCommand>>,
}

impl HeadlessView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loads(&self) -> Vec<LoadCommand> {
        self.loads.lock().iter().cloned().collect()
    }

    pub fn last_load(&self) -> Option<LoadCommand> {
        self.loads.lock().back().cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Finishes the most recent load, reporting the location it resolved to.
    /// Returns false when nothing has been loaded yet.
    pub fn complete_load(&self, resolved_url: Result<String, FrameAccessError>) -> bool {
        let Some(command) = self.last_load() else {
            return false;
        };
        self.emit(ViewEvent::LoadComplete {
            token: command.token,
            resolved_url,
        });
        true
    }

    /// Finishes the most recent load at the URL it was asked to show.
    pub fn complete_in_place(&self) -> bool {
        match self.last_load() {
            Some(command) => self.complete_load(Ok(command.url)),
            None => false,
        }
    }

    pub fn emit(&self, event: ViewEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

impl ContentView for HeadlessView {
    fn load(&self, command: &LoadCommand) {
        tracing::debug!(url = %command.url, token = command.token, reload = command.reload, "headless load");
        let mut loads = self.loads.lock();
        if loads.len() == LOAD_LOG_CAPACITY {
            loads.pop_front();
        }
        loads.push_back(command.clone());
    }

    fn subscribe(&self, events: ViewEventSender) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().insert(id, events);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().remove(&id);
    }
}
