//! The command handler: one channel's protocol state machine
//!
//! A handler instance is bound to exactly one channel. It owns the in-flight
//! FIFO and the streaming reply reader; reply `n` always completes the
//! command at the head of the queue. When the channel goes away the handler
//! decides each unreplied command's fate (retry or cancel) and hands control
//! to the watchdog. Channels are never reused across reconnects; every
//! reconnect installs a fresh handler.

use crate::activation;
use crate::command::RedisCommand;
use crate::endpoint::{Endpoint, EndpointMode, LifecycleState};
use crate::protocol::ReplyReader;
use crate::pubsub::PushFrame;
use crate::transport::BoxedStream;
use crate::watchdog::ConnectionWatchdog;
use bytes::BytesMut;
use redis_keel_core::error::{CancelReason, RedisError, RedisResult};
use redis_keel_core::value::RespValue;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, warn};

/// Why the handler's run loop ended.
enum Teardown {
    /// EOF or a socket error; the ordinary disconnect
    ChannelInactive,
    /// The byte stream stopped making sense
    ProtocolFailure(RedisError),
    /// The endpoint was closed by the user
    Closed,
}

/// Bind a fresh channel to the endpoint: run session restoration, flip the
/// endpoint to `Active` and spawn the handler's I/O task.
///
/// Returns once the endpoint is active, so callers observe a fully restored
/// session. A fatal restoration failure closes the endpoint.
pub(crate) async fn install(
    endpoint: Arc<Endpoint>,
    watchdog: Arc<ConnectionWatchdog>,
    stream: BoxedStream,
) -> RedisResult<()> {
    endpoint.transition(LifecycleState::Registered);
    endpoint.transition(LifecycleState::Connected);

    let (mut read, mut write) = tokio::io::split(stream);
    let mut reader = ReplyReader::new();

    endpoint.transition(LifecycleState::Activating);
    match activation::activate(&endpoint, &mut read, &mut write, &mut reader).await {
        Ok(()) => {}
        Err(e) if e.is_fatal() => {
            endpoint.close_with(e.duplicate());
            return Err(e);
        }
        Err(e) => {
            endpoint.transition(LifecycleState::Disconnected);
            return Err(e);
        }
    }

    if endpoint.state() == LifecycleState::Closed {
        return Err(RedisError::ClientClosed);
    }

    endpoint.transition(LifecycleState::Active);

    let handler = CommandHandler {
        endpoint: Arc::clone(&endpoint),
        watchdog,
        queue: VecDeque::new(),
        reader,
    };
    tokio::spawn(handler.run(read, write));

    // release anything buffered while the channel was away
    endpoint.flush_commands();
    Ok(())
}

struct CommandHandler {
    endpoint: Arc<Endpoint>,
    /// Non-owning observer notified on channel teardown
    watchdog: Arc<ConnectionWatchdog>,
    /// Commands written to the wire, awaiting replies, in write order
    queue: VecDeque<RedisCommand>,
    reader: ReplyReader,
}

impl CommandHandler {
    async fn run(mut self, mut read: ReadHalf<BoxedStream>, mut write: WriteHalf<BoxedStream>) {
        let teardown = loop {
            if self.endpoint.state() == LifecycleState::Closed {
                break Teardown::Closed;
            }

            // drain anything that arrived while this task was busy
            if let Err(e) = self.write_buffered(&mut write).await {
                debug!("write failed, tearing down channel: {e}");
                break Teardown::ChannelInactive;
            }

            // both read_buf and notified are cancel safe, so whichever
            // branch loses is simply retried on the next iteration
            let endpoint = Arc::clone(&self.endpoint);
            let woken_by_read = tokio::select! {
                _ = endpoint.flush_requested() => None,
                read_result = read.read_buf(self.reader.buffer_mut()) => Some(read_result),
            };

            match woken_by_read {
                None => {}
                Some(Ok(0)) => break Teardown::ChannelInactive,
                Some(Ok(_)) => {
                    if let Err(e) = self.process_frames() {
                        break Teardown::ProtocolFailure(e);
                    }
                }
                Some(Err(e)) => {
                    debug!("read failed, tearing down channel: {e}");
                    break Teardown::ChannelInactive;
                }
            }
        };

        // dropping both halves closes the transport
        drop(read);
        drop(write);
        self.channel_inactive(teardown);
    }

    /// Move buffered commands onto the wire in enqueue order. A command
    /// counts as sent only once its bytes were fully handed to the
    /// transport.
    async fn write_buffered<W: AsyncWrite + Unpin>(&mut self, write: &mut W) -> RedisResult<()> {
        let mut wrote = false;

        while let Some(mut command) = self.endpoint.pop_buffered() {
            let mut out = BytesMut::new();
            command.encode(&mut out);

            match write.write_all(&out).await {
                Ok(()) => {
                    command.mark_sent();
                    self.queue.push_back(command);
                    self.endpoint.record_in_flight(self.queue.len());
                    wrote = true;
                }
                Err(e) => {
                    // never reached the transport; retry it after reconnect
                    command.prepare_retry();
                    self.endpoint.requeue_front(vec![command]);
                    return Err(e.into());
                }
            }
        }

        if wrote {
            write.flush().await?;
        }
        Ok(())
    }

    fn process_frames(&mut self) -> RedisResult<()> {
        while let Some(frame) = self.reader.next_frame()? {
            self.on_frame(frame);
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: RespValue) {
        if self.endpoint.mode() == EndpointMode::PubSub {
            if let Some(push) = PushFrame::parse(&frame) {
                let ack_for_head = matches!(push, PushFrame::Ack { .. })
                    && self
                        .queue
                        .front()
                        .is_some_and(|head| head.kind().is_subscription_change());

                if let PushFrame::Ack { kind, name, count } = &push {
                    self.endpoint.subscriptions().apply(*kind, name);
                    self.endpoint
                        .emit(activation::subscription_event(*kind, name, *count));
                }
                if let Some(dispatcher) = self.endpoint.dispatcher() {
                    dispatcher.dispatch(&push);
                }

                // messages are out-of-band; acknowledgements double as the
                // reply to a pending SUBSCRIBE-family command
                if !ack_for_head {
                    return;
                }
            }
        }

        self.on_reply(frame);
    }

    fn on_reply(&mut self, frame: RespValue) {
        if self.queue.front().is_none() {
            warn!("dropping a reply with no command in flight: {frame:?}");
            return;
        }

        if let RespValue::Error(message) = frame {
            let command = self.pop_head();
            command.fail(RedisError::Server(message));
            return;
        }

        let head = self.queue.front_mut().expect("checked above");
        match head.feed(frame) {
            Err(e) => {
                // the frame was fully consumed off the wire; only this
                // command fails, the stream keeps going
                let command = self.pop_head();
                command.fail(e);
            }
            Ok(()) => {
                if head.output_complete() {
                    let mut command = self.pop_head();
                    if !command.is_cancelled() {
                        command.complete();
                    }
                }
            }
        }
    }

    fn pop_head(&mut self) -> RedisCommand {
        let command = self.queue.pop_front().expect("in-flight queue is empty");
        self.endpoint.record_in_flight(self.queue.len());
        command
    }

    /// The disconnect path: decide every unreplied command's fate, then let
    /// the watchdog take over.
    fn channel_inactive(mut self, teardown: Teardown) {
        let closed =
            matches!(teardown, Teardown::Closed) || self.endpoint.state() == LifecycleState::Closed;

        if closed {
            for command in self.queue.drain(..) {
                command.fail(RedisError::Cancelled(CancelReason::ClientClosed));
            }
            self.endpoint.record_in_flight(0);
            self.endpoint
                .drain_buffer_with(&RedisError::Cancelled(CancelReason::ClientClosed));
            debug!("channel released after close");
            return;
        }

        let protocol_failure = match &teardown {
            Teardown::ProtocolFailure(e) => {
                warn!("protocol failure, failing {} in-flight command(s): {e}", self.queue.len());
                for command in self.queue.drain(..) {
                    command.fail(e.duplicate());
                }
                true
            }
            _ => false,
        };

        // at-least-once: commands that were written but not answered go back
        // to the front of the buffer and are rewritten after reconnect.
        // at-most-once: a command that reached the transport may have been
        // executed, so it is cancelled instead; unsent commands are safe to
        // retry under either guarantee.
        let at_least_once = self.endpoint.options().auto_reconnect;
        let mut retry = Vec::with_capacity(self.queue.len());
        for mut command in self.queue.drain(..) {
            if command.is_cancelled() {
                continue;
            }
            if at_least_once || !command.was_sent() {
                command.prepare_retry();
                retry.push(command);
            } else {
                command.fail(RedisError::Cancelled(CancelReason::Disconnected));
            }
        }
        self.endpoint.record_in_flight(0);
        if !retry.is_empty() {
            debug!("requeueing {} unreplied command(s) for retry", retry.len());
            self.endpoint.requeue_front(retry);
        }

        self.endpoint.transition(LifecycleState::Disconnected);
        self.watchdog.channel_inactive(protocol_failure);
    }
}
