//! The connection watchdog: reconnect scheduling with exponential backoff
//!
//! The watchdog observes channel teardown and re-establishes the channel
//! with `min(cap, base * 2^(n-1))` backoff. It can be told to ignore
//! channel-inactive events or to suspend reconnecting entirely; both
//! controls are observable, which is how the reliability tests steer the
//! reconnect machinery without reaching into it.

use crate::endpoint::{Endpoint, LifecycleState};
use crate::events::ConnectionEvent;
use crate::handler;
use crate::transport::Connector;
use redis_keel_core::error::RedisError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Schedules reconnect attempts for one endpoint.
pub struct ConnectionWatchdog {
    endpoint: Arc<Endpoint>,
    connector: Arc<dyn Connector>,
    /// Self-handle for spawning the reconnect task from `&self` methods
    this: Weak<ConnectionWatchdog>,
    listen_on_channel_inactive: AtomicBool,
    reconnect_suspended: AtomicBool,
    /// One reconnect sequence at a time
    running: AtomicBool,
}

impl ConnectionWatchdog {
    pub(crate) fn new(endpoint: Arc<Endpoint>, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            endpoint,
            connector,
            this: this.clone(),
            listen_on_channel_inactive: AtomicBool::new(true),
            reconnect_suspended: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    /// Whether channel-inactive events trigger a reconnect.
    pub fn is_listen_on_channel_inactive(&self) -> bool {
        self.listen_on_channel_inactive.load(Ordering::Acquire)
    }

    /// Enable or disable reacting to channel-inactive events.
    pub fn set_listen_on_channel_inactive(&self, enabled: bool) {
        self.listen_on_channel_inactive
            .store(enabled, Ordering::Release);
    }

    /// Whether reconnecting is currently suspended.
    pub fn is_reconnect_suspended(&self) -> bool {
        self.reconnect_suspended.load(Ordering::Acquire)
    }

    /// Suspend or resume reconnecting. A running backoff sequence observes
    /// the flag before each attempt.
    pub fn set_reconnect_suspended(&self, suspended: bool) {
        self.reconnect_suspended.store(suspended, Ordering::Release);
    }

    /// Called by the handler when its channel goes away.
    pub(crate) fn channel_inactive(&self, protocol_failure: bool) {
        if protocol_failure
            && self
                .endpoint
                .options()
                .suspend_reconnect_on_protocol_failure
        {
            warn!("protocol failure observed, suspending reconnect");
            self.set_reconnect_suspended(true);
        }

        if !self.endpoint.options().auto_reconnect {
            return;
        }
        if !self.is_listen_on_channel_inactive() {
            debug!("channel inactive ignored, not listening");
            return;
        }
        self.schedule_reconnect();
    }

    /// Start a reconnect sequence unless one is already running, the
    /// endpoint is closed, or reconnecting is suspended.
    pub fn schedule_reconnect(&self) {
        if self.endpoint.state() == LifecycleState::Closed {
            return;
        }
        if self.is_reconnect_suspended() {
            debug!("reconnect requested while suspended");
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(this.reconnect_sequence());
    }

    async fn reconnect_sequence(self: Arc<Self>) {
        let policy = self.endpoint.options().reconnect.clone();
        let mut attempt = 0u32;

        loop {
            if self.endpoint.state() == LifecycleState::Closed || self.is_reconnect_suspended() {
                break;
            }

            attempt += 1;
            let delay = policy.delay_for_attempt(attempt);
            debug!("scheduling reconnect attempt {attempt} in {delay:?}");
            self.endpoint
                .emit(ConnectionEvent::ReconnectScheduled { attempt, delay });
            sleep(delay).await;

            if self.endpoint.state() == LifecycleState::Closed || self.is_reconnect_suspended() {
                break;
            }

            let error = match self.connector.connect().await {
                Ok(stream) => {
                    match handler::install(
                        Arc::clone(&self.endpoint),
                        Arc::clone(&self),
                        stream,
                    )
                    .await
                    {
                        Ok(()) => {
                            info!("reconnected after {attempt} attempt(s)");
                            break;
                        }
                        // a fatal activation failure already closed the endpoint
                        Err(e) if e.is_fatal() => break,
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            warn!("reconnect attempt {attempt} failed: {error}");
            self.endpoint.emit(ConnectionEvent::ReconnectFailed {
                attempt,
                error: error.to_string(),
            });

            if self
                .endpoint
                .options()
                .cancel_commands_on_reconnect_failure
                && attempt == 1
            {
                let failure = RedisError::ReconnectFailed {
                    attempts: attempt,
                    last_error: error.to_string(),
                };
                self.endpoint.drain_buffer_with(&failure);
                self.set_reconnect_suspended(true);
                break;
            }
        }

        self.running.store(false, Ordering::Release);
    }
}
