//! Navigation log with a cursor.
//!
//! The store is pure state and never talks to the embedded view. Every
//! mutating call reports whether anything changed; callers turn a change into
//! a [`LoadCommand`] for the view.

use serde::Serialize;
use std::time::SystemTime;

/// Sentinel the embedded view reports while it holds an empty document.
pub const BLANK_URL: &str = "about:blank";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub url: String,
    pub visited_at: SystemTime,
}

impl HistoryEntry {
    fn new(url: String) -> Self {
        Self {
            url,
            visited_at: SystemTime::now(),
        }
    }
}

/// What the embedded view should display next.
///
/// `token` increases with every navigation-initiating action, so a refresh of
/// an unchanged URL still reads as a new load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadCommand {
    pub url: String,
    pub token: u64,
    pub reload: bool,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    entries: Vec<HistoryEntry>,
    cursor: usize,
    is_loading: bool,
    load_token: u64,
    reload_requested: bool,
    blank_url: String,
}

#[allow(clippy::len_without_is_empty)]
impl HistoryStore {
    /// Seeds the log with `initial_url`. The seed counts as an in-progress load.
    pub fn new(initial_url: impl Into<String>) -> Self {
        Self {
            entries: vec![HistoryEntry::new(initial_url.into())],
            cursor: 0,
            is_loading: true,
            load_token: 0,
            reload_requested: false,
            blank_url: BLANK_URL.to_string(),
        }
    }

    pub fn with_blank_url(mut self, blank_url: impl Into<String>) -> Self {
        self.blank_url = blank_url.into();
        self
    }

    pub fn current_url(&self) -> &str {
        &self.entries[self.cursor].url
    }

    pub fn current_entry(&self) -> &HistoryEntry {
        &self.entries[self.cursor]
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn urls(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.url.as_str()).collect()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn can_go_back(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_go_forward(&self) -> bool {
        self.cursor + 1 < self.entries.len()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn load_token(&self) -> u64 {
        self.load_token
    }

    pub fn blank_url(&self) -> &str {
        &self.blank_url
    }

    pub fn load_command(&self) -> LoadCommand {
        LoadCommand {
            url: self.current_url().to_string(),
            token: self.load_token,
            reload: self.reload_requested,
        }
    }

    /// Pushes `url`, dropping any forward branch. Navigating to the URL already
    /// displayed is a no-op.
    pub fn navigate(&mut self, url: impl Into<String>) -> bool {
        let url = url.into();
        if url == self.current_url() {
            return false;
        }

        self.entries.truncate(self.cursor + 1);
        self.entries.push(HistoryEntry::new(url));
        self.cursor = self.entries.len() - 1;
        self.begin_load(false);
        true
    }

    pub fn go_back(&mut self) -> bool {
        if !self.can_go_back() {
            return false;
        }
        self.cursor -= 1;
        self.begin_load(false);
        true
    }

    pub fn go_forward(&mut self) -> bool {
        if !self.can_go_forward() {
            return false;
        }
        self.cursor += 1;
        self.begin_load(false);
        true
    }

    pub fn refresh(&mut self) {
        self.begin_load(true);
    }

    /// Overwrites the entry under the cursor with what the view actually
    /// loaded. Depth, cursor and forward history are left alone.
    pub fn reconcile_external_url(&mut self, url: impl Into<String>) -> bool {
        let url = url.into();
        if url.is_empty() || url == self.blank_url || url == self.current_url() {
            return false;
        }

        let entry = &mut self.entries[self.cursor];
        entry.url = url;
        entry.visited_at = SystemTime::now();
        true
    }

    /// Returns whether a load was pending.
    pub fn mark_loaded(&mut self) -> bool {
        std::mem::replace(&mut self.is_loading, false)
    }

    fn begin_load(&mut self, reload: bool) {
        self.is_loading = true;
        self.load_token += 1;
        self.reload_requested = reload;
    }
}
