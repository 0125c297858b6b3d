//! # relay-engine
//!
//! Turns the HAPI session event feed into chat notifications.
//!
//! - [`preview`]: renders message payloads as short human-readable text
//! - [`format`]: session labels, listings and notification texts
//! - [`cache`]: shared session list kept current by incoming patches
//! - [`backoff`]: reconnect delay schedule
//! - [`notifier`]: chunked fan-out to notification observers
//! - [`engine`]: per-session cursors, pending approvals, debounced refresh

#![deny(unsafe_code)]

pub mod backoff;
pub mod cache;
pub mod engine;
pub mod format;
pub mod notifier;
pub mod preview;

pub use backoff::Backoff;
pub use cache::SessionCache;
pub use engine::{DecisionOutcome, EngineConfig, EngineStats, ReconcileEngine};
pub use notifier::{
    split_message, ConsoleObserver, NotificationSink, Notifier, NotifyError, Observer,
    WebhookObserver,
};
pub use preview::{extract_preview, PreviewMode};
