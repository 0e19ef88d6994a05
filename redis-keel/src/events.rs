//! Observable connection events
//!
//! Every endpoint broadcasts lifecycle transitions, reconnect activity and
//! subscription restoration so tests and monitoring code can watch the state
//! machine without reaching inside it.

use crate::endpoint::LifecycleState;
use std::time::Duration;

/// An event emitted by an endpoint.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The endpoint lifecycle state changed.
    StateChanged {
        /// Previous state
        from: LifecycleState,
        /// New state
        to: LifecycleState,
    },
    /// The watchdog scheduled a reconnect attempt.
    ReconnectScheduled {
        /// 1-indexed attempt number within this reconnect sequence
        attempt: u32,
        /// Backoff delay before the attempt dials
        delay: Duration,
    },
    /// A reconnect attempt failed.
    ReconnectFailed {
        /// 1-indexed attempt number within this reconnect sequence
        attempt: u32,
        /// Description of the connect failure
        error: String,
    },
    /// A channel subscription was confirmed by the server.
    Subscribed {
        /// Channel name
        channel: String,
        /// Server-reported subscription count
        count: i64,
    },
    /// A channel subscription was removed.
    Unsubscribed {
        /// Channel name
        channel: String,
        /// Server-reported subscription count
        count: i64,
    },
    /// A pattern subscription was confirmed by the server.
    PatternSubscribed {
        /// Pattern
        pattern: String,
        /// Server-reported subscription count
        count: i64,
    },
    /// A pattern subscription was removed.
    PatternUnsubscribed {
        /// Pattern
        pattern: String,
        /// Server-reported subscription count
        count: i64,
    },
    /// Session restoration replayed the subscription set after a reconnect.
    SubscriptionsRestored {
        /// Number of channels re-subscribed
        channels: usize,
        /// Number of patterns re-subscribed
        patterns: usize,
    },
}
