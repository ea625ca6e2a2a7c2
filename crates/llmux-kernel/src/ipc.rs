//! Side-channel event bus.
//!
//! The bus is a thin publish/subscribe layer over
//! [`tokio::sync::broadcast`].  The generation engine publishes token-usage
//! counters and human-readable notifications here; nothing in the engine
//! depends on a subscriber being present.
//!
//! Each event is published once as an [`Arc<Event>`]; every subscriber gets
//! a pointer to the same payload.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use llmux_kernel::ipc::{EventBus, Event, NotificationKind};
//! # async fn example() {
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.notify(NotificationKind::Warning, "Response truncated");
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.topic(), "notification");
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Token counters reported by a backend for one request.
///
/// Every field is advisory.  Backends that do not report a counter leave it
/// at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input: u64,
    /// Generated tokens.
    pub output: u64,
    /// Total as reported by the backend, or `input + output`.
    pub total: u64,
    /// Prompt tokens served from a cache.
    pub cached: u64,
    /// Tokens spent on tool-use prompts.
    pub tool_use: u64,
}

impl TokenUsage {
    /// Build a usage record from input/output counts, deriving the total.
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input + output,
            ..Self::default()
        }
    }

    /// Returns `true` when no counter is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// What a notification is about.  Subscribers use this to pick a rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Plain status text (e.g. model commentary alongside a tool call).
    Info,
    /// Non-fatal condition the user should know about.
    Warning,
    /// Model reasoning text.
    Thought,
}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// An event that flows through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A backend reported token counters for a completed request.
    TokenUsage {
        id: Uuid,
        /// Backend that served the request (e.g. `"ollama"`).
        provider: String,
        usage: TokenUsage,
        timestamp: DateTime<Utc>,
    },

    /// Human-readable text for the user.
    Notification {
        id: Uuid,
        kind: NotificationKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Create a token-usage event stamped with the current time.
    pub fn token_usage(provider: impl Into<String>, usage: TokenUsage) -> Self {
        Self::TokenUsage {
            id: Uuid::now_v7(),
            provider: provider.into(),
            usage,
            timestamp: Utc::now(),
        }
    }

    /// Create a notification event stamped with the current time.
    pub fn notification(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self::Notification {
            id: Uuid::now_v7(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Short topic name for routing.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::TokenUsage { .. } => "tokencount",
            Self::Notification { .. } => "notification",
        }
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Broadcast channel carrying usage and notification events.
///
/// Clones share one underlying channel, so the engine and its adapters can
/// each hold a handle.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    sender: broadcast::Sender<Arc<Event>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// A bus buffering up to `capacity` undelivered events per subscriber.
    ///
    /// A subscriber that falls behind by more than `capacity` events receives
    /// [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EventBusInner { sender }),
        }
    }

    /// Send `event` to every live subscriber.
    ///
    /// Returns the number of receivers that will observe this event.  With no
    /// active subscribers the event is dropped and 0 is returned.
    pub fn publish(&self, event: Event) -> usize {
        let topic = event.topic();
        match self.inner.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(topic, receivers = n, "event published");
                n
            }
            Err(_) => {
                tracing::trace!(topic, "event published but no active receivers");
                0
            }
        }
    }

    /// Publish a notification.
    pub fn notify(&self, kind: NotificationKind, message: impl Into<String>) -> usize {
        self.publish(Event::notification(kind, message))
    }

    /// Publish token counters for `provider`.
    pub fn publish_usage(&self, provider: &str, usage: TokenUsage) -> usize {
        self.publish(Event::token_usage(provider, usage))
    }

    /// Start listening.
    ///
    /// Events published *before* this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.sender.subscribe()
    }

    /// Live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
