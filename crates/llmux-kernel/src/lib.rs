//! Shared kernel services for llmux.
//!
//! - **[`ipc`]** -- Publish/subscribe event bus backed by
//!   [`tokio::sync::broadcast`], carrying token-usage counters and
//!   user-visible notifications.  Publishing never fails, so the kernel
//!   has no error type.

pub mod ipc;

pub use ipc::{Event, EventBus, NotificationKind, TokenUsage};
