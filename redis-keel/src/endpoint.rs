//! The endpoint: thread-safe command submission and buffering
//!
//! One endpoint represents one logical client-to-server association. It owns
//! the command buffer and the current channel's lifecycle state, admits or
//! rejects submissions, and wakes the connection task to move buffered
//! commands onto the wire. Producers call [`Endpoint::write`] from any task;
//! all queue-to-wire work happens on the connection's I/O task.

use crate::command::{AsyncCommand, RedisCommand};
use crate::events::ConnectionEvent;
use crate::pubsub::{SubscriptionDispatcher, SubscriptionSet};
use redis_keel_core::{
    config::{ClientOptions, DisconnectedBehavior, RedisUrl},
    error::{CancelReason, RedisError},
    resources::ClientResources,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

/// Externally observable connection lifecycle.
///
/// Transitions are monotonic except `Active ⇄ Disconnected`, which oscillate
/// across reconnects. Only `Active` releases writes to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No channel has ever been bound
    NotConnected,
    /// A channel is bound but the socket is not yet established
    Registered,
    /// The socket is established
    Connected,
    /// Session restoration is running
    Activating,
    /// The endpoint accepts and writes user commands
    Active,
    /// The channel was lost
    Disconnected,
    /// The endpoint was closed and rejects all submissions
    Closed,
}

/// Whether this endpoint carries regular commands or a pub/sub session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndpointMode {
    Command,
    PubSub,
}

/// Counts of commands awaiting the wire and awaiting replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Commands accepted but not yet written
    pub buffered: usize,
    /// Commands written and awaiting replies
    pub in_flight: usize,
}

struct EndpointShared {
    state: LifecycleState,
    buffer: VecDeque<RedisCommand>,
    auto_flush: bool,
    /// With auto-flush off, how many buffered commands an explicit flush
    /// has released to the wire
    flush_pending: usize,
}

/// The channel writer. Shared between the facade, the connection task and
/// the watchdog via `Arc`.
pub struct Endpoint {
    options: ClientOptions,
    url: RedisUrl,
    mode: EndpointMode,
    dispatcher: Option<SubscriptionDispatcher>,
    shared: Mutex<EndpointShared>,
    subscriptions: Mutex<SubscriptionSet>,
    in_flight: AtomicUsize,
    flush: Notify,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Endpoint {
    pub(crate) fn new(
        options: ClientOptions,
        url: RedisUrl,
        resources: &ClientResources,
        mode: EndpointMode,
        dispatcher: Option<SubscriptionDispatcher>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(resources.event_bus_capacity());
        Arc::new(Self {
            options,
            url,
            mode,
            dispatcher,
            shared: Mutex::new(EndpointShared {
                state: LifecycleState::NotConnected,
                buffer: VecDeque::new(),
                auto_flush: true,
                flush_pending: 0,
            }),
            subscriptions: Mutex::new(SubscriptionSet::default()),
            in_flight: AtomicUsize::new(0),
            flush: Notify::new(),
            events,
        })
    }

    /// Behavioral options for this endpoint.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// The endpoint URI this endpoint dials.
    pub fn url(&self) -> &RedisUrl {
        &self.url
    }

    pub(crate) fn mode(&self) -> EndpointMode {
        self.mode
    }

    pub(crate) fn dispatcher(&self) -> Option<&SubscriptionDispatcher> {
        self.dispatcher.as_ref()
    }

    /// Submit a command. Never blocks; a rejected command completes its
    /// future synchronously and is never seen by the connection task.
    pub fn write(&self, command: RedisCommand) -> AsyncCommand {
        let handle = command.handle();
        let mut shared = self.lock_shared();

        if shared.state == LifecycleState::Closed {
            drop(shared);
            command.fail(RedisError::ClientClosed);
            return handle;
        }

        let queued = shared.buffer.len() + self.in_flight.load(Ordering::Acquire);
        if queued >= self.options.request_queue_size {
            drop(shared);
            command.fail(RedisError::QueueOverflow(self.options.request_queue_size));
            return handle;
        }

        if shared.state == LifecycleState::Disconnected {
            let accept = match self.options.disconnected_behavior {
                DisconnectedBehavior::Default => self.options.auto_reconnect,
                DisconnectedBehavior::AcceptCommands => true,
                DisconnectedBehavior::RejectCommands => false,
            };
            if !accept {
                drop(shared);
                command.fail(RedisError::RejectedWhileDisconnected);
                return handle;
            }
        }

        shared.buffer.push_back(command);
        let should_flush = shared.state == LifecycleState::Active && shared.auto_flush;
        drop(shared);

        if should_flush {
            self.flush.notify_one();
        }
        handle
    }

    /// Ask the connection task to write buffered commands now. Required
    /// after submissions made with auto-flush disabled.
    pub fn flush_commands(&self) {
        let mut shared = self.lock_shared();
        shared.flush_pending = shared.flush_pending.max(shared.buffer.len());
        drop(shared);
        self.flush.notify_one();
    }

    /// Toggle flushing on every submission. With auto-flush off, callers
    /// batch several writes into one transport flush.
    pub fn set_auto_flush(&self, enabled: bool) {
        let mut shared = self.lock_shared();
        shared.auto_flush = enabled;
        drop(shared);
        if enabled {
            self.flush.notify_one();
        }
    }

    /// Close the endpoint: cancel everything buffered, reject future
    /// submissions and tear down the channel.
    pub fn close(&self) {
        self.close_with(RedisError::Cancelled(CancelReason::ClientClosed));
    }

    /// Close with a specific failure, e.g. a fatal authentication error.
    pub(crate) fn close_with(&self, error: RedisError) {
        let drained = {
            let mut shared = self.lock_shared();
            if shared.state == LifecycleState::Closed {
                return;
            }
            let from = shared.state;
            shared.state = LifecycleState::Closed;
            self.emit(ConnectionEvent::StateChanged {
                from,
                to: LifecycleState::Closed,
            });
            shared.buffer.drain(..).collect::<Vec<_>>()
        };

        debug!("closing endpoint, failing {} buffered command(s)", drained.len());
        for command in &drained {
            command.fail(error.duplicate());
        }
        // wake the connection task so it can fail its in-flight queue
        self.flush.notify_waiters();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lock_shared().state
    }

    /// `true` while the endpoint accepts writes to the wire.
    pub fn is_open(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    /// Counts of buffered and in-flight commands.
    pub fn queue_snapshot(&self) -> QueueSnapshot {
        let shared = self.lock_shared();
        QueueSnapshot {
            buffered: shared.buffer.len(),
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }

    /// Subscribe to connection events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Move to a new lifecycle state, emitting the change. Once `Closed`,
    /// the state never changes again.
    pub(crate) fn transition(&self, to: LifecycleState) -> bool {
        let mut shared = self.lock_shared();
        if shared.state == LifecycleState::Closed || shared.state == to {
            return false;
        }
        let from = shared.state;
        shared.state = to;
        drop(shared);

        debug!("connection state {from:?} -> {to:?}");
        self.emit(ConnectionEvent::StateChanged { from, to });
        true
    }

    /// Pop the oldest non-cancelled buffered command, only while active and
    /// only when auto-flush is on or an explicit flush released it.
    /// Cancelled commands already resolved their futures and are dropped.
    pub(crate) fn pop_buffered(&self) -> Option<RedisCommand> {
        let mut shared = self.lock_shared();
        if shared.state != LifecycleState::Active {
            return None;
        }
        while shared.auto_flush || shared.flush_pending > 0 {
            let Some(command) = shared.buffer.pop_front() else {
                shared.flush_pending = 0;
                return None;
            };
            shared.flush_pending = shared.flush_pending.saturating_sub(1);
            if command.is_cancelled() {
                continue;
            }
            return Some(command);
        }
        None
    }

    /// Return commands to the front of the buffer, preserving their order
    /// ahead of anything submitted later.
    pub(crate) fn requeue_front(&self, commands: Vec<RedisCommand>) {
        let mut shared = self.lock_shared();
        for command in commands.into_iter().rev() {
            shared.buffer.push_front(command);
        }
    }

    /// Fail every buffered command, e.g. when reconnecting is abandoned.
    pub(crate) fn drain_buffer_with(&self, error: &RedisError) {
        let drained = {
            let mut shared = self.lock_shared();
            shared.buffer.drain(..).collect::<Vec<_>>()
        };
        if !drained.is_empty() {
            warn!("failing {} buffered command(s): {error}", drained.len());
        }
        for command in &drained {
            command.fail(error.duplicate());
        }
    }

    pub(crate) fn record_in_flight(&self, len: usize) {
        self.in_flight.store(len, Ordering::Release);
    }

    /// Wait until a flush is requested. Used only by the connection task.
    pub(crate) async fn flush_requested(&self) {
        self.flush.notified().await;
    }

    pub(crate) fn subscriptions(&self) -> MutexGuard<'_, SubscriptionSet> {
        self.subscriptions.lock().expect("subscription set poisoned")
    }

    fn lock_shared(&self) -> MutexGuard<'_, EndpointShared> {
        self.shared.lock().expect("endpoint state poisoned")
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.queue_snapshot();
        f.debug_struct("Endpoint")
            .field("state", &self.state())
            .field("buffered", &snapshot.buffered)
            .field("in_flight", &snapshot.in_flight)
            .finish()
    }
}
