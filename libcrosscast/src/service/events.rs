//! Event system for dispatch progress tracking
//!
//! An in-process event bus that distributes dispatch, job and refresh events
//! to subscribers without blocking the code that emits them.
//!
//! The bus is a `tokio::sync::broadcast` channel. If no subscribers exist,
//! events are dropped immediately; lagging subscribers lose the oldest events
//! rather than slowing emitters down.
//!
//! # Example
//!
//! ```no_run
//! use libcrosscast::service::events::{Event, EventBus};
//! use libcrosscast::types::Platform;
//!
//! # async fn example() {
//! let event_bus = EventBus::new(100);
//! let mut receiver = event_bus.subscribe();
//!
//! event_bus.emit(Event::DispatchStarted {
//!     post_id: "abc123".to_string(),
//!     platforms: vec![Platform::Facebook],
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{Platform, PostStatus};

pub type EventReceiver = broadcast::Receiver<Event>;

/// Event bus for distributing progress events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus
    ///
    /// `capacity` is how many events are buffered per subscriber before the
    /// oldest are dropped for a lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Events emitted by the dispatcher, workers and refresher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A full fan-out started
    DispatchStarted {
        post_id: String,
        platforms: Vec<Platform>,
    },

    TargetSucceeded {
        post_id: String,
        platform: Platform,
        social_account_id: String,
        platform_post_id: String,
    },

    TargetFailed {
        post_id: String,
        platform: Platform,
        social_account_id: String,
        error: String,
    },

    /// Every branch of a fan-out settled
    FanOutCompleted {
        post_id: String,
        status: PostStatus,
        results: Vec<TargetResult>,
    },

    /// A background job gave up after its final attempt
    JobFailed {
        post_id: String,
        platform: Platform,
        social_account_id: Option<String>,
        attempts: u32,
        error: String,
    },

    RefreshCompleted {
        scanned: usize,
        refreshed: usize,
        failed: usize,
    },
}

/// Outcome of one branch of a fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
    pub platform: Platform,
    pub social_account_id: String,
    pub success: bool,
    /// Id assigned by the platform (if successful)
    pub platform_post_id: Option<String>,
    /// Error message (if failed)
    pub error: Option<String>,
}
