pub mod history;
pub mod navigation;

pub use history::{HistoryEntry, HistoryStore, LoadCommand};
pub use navigation::{
    ContentView, FrameAccessError, HeadlessView, LoadOutcome, LoadSubscription,
    NavigationController, ViewEvent,
};
