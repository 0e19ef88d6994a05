//! Command descriptors, output decoders and the async completion cell
//!
//! A [`RedisCommand`] travels through the endpoint buffer and the handler's
//! in-flight queue while the submitter holds its [`AsyncCommand`] handle.
//! Both share one completion cell; the cell resolves exactly once and fires
//! registered listeners exactly once.

use crate::codec::KeyValueCodec;
use crate::protocol;
use bytes::{Bytes, BytesMut};
use redis_keel_core::error::{CancelReason, RedisError, RedisResult};
use redis_keel_core::value::RespValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// The Redis verbs the core and its facade submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CommandKind {
    Ping,
    Auth,
    Select,
    Quit,
    Echo,
    Get,
    Set,
    Del,
    Incr,
    Publish,
    Subscribe,
    Unsubscribe,
    Psubscribe,
    Punsubscribe,
}

impl CommandKind {
    /// Wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Auth => "AUTH",
            Self::Select => "SELECT",
            Self::Quit => "QUIT",
            Self::Echo => "ECHO",
            Self::Get => "GET",
            Self::Set => "SET",
            Self::Del => "DEL",
            Self::Incr => "INCR",
            Self::Publish => "PUBLISH",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Psubscribe => "PSUBSCRIBE",
            Self::Punsubscribe => "PUNSUBSCRIBE",
        }
    }

    /// Whether this verb mutates the pub/sub subscription set.
    pub fn is_subscription_change(&self) -> bool {
        matches!(
            self,
            Self::Subscribe | Self::Unsubscribe | Self::Psubscribe | Self::Punsubscribe
        )
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Argument list for one command, already encoded for the wire.
#[derive(Debug, Clone, Default)]
pub struct CommandArgs {
    args: Vec<Bytes>,
}

impl CommandArgs {
    /// Start an empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key through the codec.
    pub fn key<C: KeyValueCodec>(mut self, codec: &C, key: &C::Key) -> RedisResult<Self> {
        self.args.push(codec.encode_key(key)?);
        Ok(self)
    }

    /// Append a value through the codec.
    pub fn value<C: KeyValueCodec>(mut self, codec: &C, value: &C::Value) -> RedisResult<Self> {
        self.args.push(codec.encode_value(value)?);
        Ok(self)
    }

    /// Append a raw argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append an integer argument.
    pub fn int(mut self, n: i64) -> Self {
        self.args.push(Bytes::from(n.to_string().into_bytes()));
        self
    }

    /// The encoded arguments, without the command name.
    pub fn as_slice(&self) -> &[Bytes] {
        &self.args
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// `true` when no arguments were added.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Receives the decoded reply for one command.
///
/// The handler feeds the head-of-queue command's output and pops the command
/// only when the output reports completion. `reset` returns the output to
/// its initial state before a retry rewrites the command.
pub trait CommandOutput: Send {
    /// Accept the decoded reply frame. An error here fails the owning
    /// command with a decode error without disturbing the connection.
    fn set(&mut self, frame: RespValue) -> RedisResult<()>;

    /// Whether the full reply has been received.
    fn is_complete(&self) -> bool;

    /// Drop any partial state so the command can be written again.
    fn reset(&mut self);

    /// Take the accumulated reply. Only meaningful once complete.
    fn take(&mut self) -> RespValue;
}

/// Accepts any reply frame verbatim.
#[derive(Debug, Default)]
pub struct ValueOutput {
    value: Option<RespValue>,
}

impl CommandOutput for ValueOutput {
    fn set(&mut self, frame: RespValue) -> RedisResult<()> {
        self.value = Some(frame);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.value.is_some()
    }

    fn reset(&mut self) {
        self.value = None;
    }

    fn take(&mut self) -> RespValue {
        self.value.take().unwrap_or(RespValue::Null)
    }
}

/// Requires a simple-string status reply such as `+OK`.
#[derive(Debug, Default)]
pub struct StatusOutput {
    status: Option<String>,
}

impl CommandOutput for StatusOutput {
    fn set(&mut self, frame: RespValue) -> RedisResult<()> {
        match frame {
            RespValue::Simple(s) => {
                self.status = Some(s);
                Ok(())
            }
            other => Err(RedisError::Decode(format!(
                "expected a status reply, got {other:?}"
            ))),
        }
    }

    fn is_complete(&self) -> bool {
        self.status.is_some()
    }

    fn reset(&mut self) {
        self.status = None;
    }

    fn take(&mut self) -> RespValue {
        match self.status.take() {
            Some(s) => RespValue::Simple(s),
            None => RespValue::Null,
        }
    }
}

/// Requires an integer reply.
#[derive(Debug, Default)]
pub struct IntegerOutput {
    value: Option<i64>,
}

impl CommandOutput for IntegerOutput {
    fn set(&mut self, frame: RespValue) -> RedisResult<()> {
        match frame {
            RespValue::Integer(n) => {
                self.value = Some(n);
                Ok(())
            }
            other => Err(RedisError::Decode(format!(
                "expected an integer reply, got {other:?}"
            ))),
        }
    }

    fn is_complete(&self) -> bool {
        self.value.is_some()
    }

    fn reset(&mut self) {
        self.value = None;
    }

    fn take(&mut self) -> RespValue {
        match self.value.take() {
            Some(n) => RespValue::Integer(n),
            None => RespValue::Null,
        }
    }
}

type Listener = Box<dyn FnOnce(&RedisResult<RespValue>) + Send>;

struct CellInner {
    outcome: Option<RedisResult<RespValue>>,
    listeners: Vec<Listener>,
}

/// Shared completion state between the queues and the submitter's handle.
pub struct CommandCell {
    inner: Mutex<CellInner>,
    cancelled: AtomicBool,
    done: Notify,
}

impl CommandCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CellInner {
                outcome: None,
                listeners: Vec::new(),
            }),
            cancelled: AtomicBool::new(false),
            done: Notify::new(),
        })
    }

    /// Resolve the cell. The first resolution wins; later calls are no-ops,
    /// which is how a discarded reply for a cancelled command disappears.
    /// Listeners run outside the lock so they may touch the cell themselves.
    fn resolve(&self, outcome: RedisResult<RespValue>) {
        let (listeners, snapshot) = {
            let mut inner = self.inner.lock().expect("command cell poisoned");
            if inner.outcome.is_some() {
                return;
            }
            let snapshot = match &outcome {
                Ok(value) => Ok(value.clone()),
                Err(e) => Err(e.duplicate()),
            };
            inner.outcome = Some(outcome);
            (std::mem::take(&mut inner.listeners), snapshot)
        };

        for listener in listeners {
            listener(&snapshot);
        }
        self.done.notify_waiters();
    }

    fn is_done(&self) -> bool {
        self.inner
            .lock()
            .expect("command cell poisoned")
            .outcome
            .is_some()
    }

    fn peek(&self) -> Option<RedisResult<RespValue>> {
        let inner = self.inner.lock().expect("command cell poisoned");
        inner.outcome.as_ref().map(|outcome| match outcome {
            Ok(value) => Ok(value.clone()),
            Err(e) => Err(e.duplicate()),
        })
    }
}

/// The submitter's handle on a command: a future with listener registration.
#[derive(Clone)]
pub struct AsyncCommand {
    cell: Arc<CommandCell>,
}

impl AsyncCommand {
    /// Wait for the reply without a deadline.
    pub async fn await_reply(&self) -> RedisResult<RespValue> {
        loop {
            let notified = self.cell.done.notified();
            if let Some(outcome) = self.cell.peek() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Wait for the reply with a deadline. A timeout does not remove the
    /// command; it may still complete later.
    pub async fn await_reply_timeout(&self, deadline: Duration) -> RedisResult<RespValue> {
        match tokio::time::timeout(deadline, self.await_reply()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RedisError::Timeout),
        }
    }

    /// Whether the command reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    /// Whether the command was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cell.cancelled.load(Ordering::Acquire)
    }

    /// The failure the command completed with, if any. Server errors are
    /// reported here with their raw message.
    pub fn error(&self) -> Option<RedisError> {
        match self.cell.peek() {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }

    /// The decoded value, if the command completed successfully.
    pub fn try_value(&self) -> Option<RespValue> {
        match self.cell.peek() {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    /// Cancel the command. An unsent command is dropped from the buffer at
    /// the next flush; an in-flight command stays queued and its eventual
    /// reply is discarded.
    pub fn cancel(&self) {
        if self.cell.is_done() {
            return;
        }
        self.cell.cancelled.store(true, Ordering::Release);
        self.cell
            .resolve(Err(RedisError::Cancelled(CancelReason::Explicit)));
    }

    /// Register a completion listener. Registration after completion fires
    /// immediately; otherwise the listener fires exactly once on resolution.
    pub fn on_complete(&self, listener: impl FnOnce(&RedisResult<RespValue>) + Send + 'static) {
        let mut inner = self.cell.inner.lock().expect("command cell poisoned");
        match inner.outcome.as_ref() {
            Some(outcome) => {
                let snapshot = match outcome {
                    Ok(value) => Ok(value.clone()),
                    Err(e) => Err(e.duplicate()),
                };
                drop(inner);
                listener(&snapshot);
            }
            None => inner.listeners.push(Box::new(listener)),
        }
    }
}

/// A command travelling through the endpoint buffer and in-flight queue.
pub struct RedisCommand {
    kind: CommandKind,
    args: CommandArgs,
    output: Box<dyn CommandOutput>,
    cell: Arc<CommandCell>,
    sent: bool,
}

impl RedisCommand {
    /// Create a command with its output decoder.
    pub fn new(kind: CommandKind, args: CommandArgs, output: Box<dyn CommandOutput>) -> Self {
        Self {
            kind,
            args,
            output,
            cell: CommandCell::new(),
            sent: false,
        }
    }

    /// The submitter-facing handle sharing this command's completion cell.
    pub fn handle(&self) -> AsyncCommand {
        AsyncCommand {
            cell: Arc::clone(&self.cell),
        }
    }

    /// The verb being executed.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Encoded arguments, without the command name.
    pub fn args(&self) -> &CommandArgs {
        &self.args
    }

    /// Serialize this command as a RESP multi-bulk request.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(Bytes::from_static(self.kind.as_str().as_bytes()));
        parts.extend_from_slice(self.args.as_slice());
        protocol::encode_request(&parts, dst);
    }

    /// Whether the bytes of this command were flushed to the transport.
    pub fn was_sent(&self) -> bool {
        self.sent
    }

    /// Mark the command as flushed to the transport.
    pub(crate) fn mark_sent(&mut self) {
        self.sent = true;
    }

    /// Return the command to its pre-write state for a retry.
    pub(crate) fn prepare_retry(&mut self) {
        self.sent = false;
        self.output.reset();
    }

    /// Whether the submitter cancelled this command.
    pub fn is_cancelled(&self) -> bool {
        self.cell.cancelled.load(Ordering::Acquire)
    }

    /// Feed the decoded reply frame to the output decoder.
    pub(crate) fn feed(&mut self, frame: RespValue) -> RedisResult<()> {
        self.output.set(frame)
    }

    /// Whether the output decoder has the full reply.
    pub(crate) fn output_complete(&self) -> bool {
        self.output.is_complete()
    }

    /// Complete successfully with the output's accumulated value.
    pub(crate) fn complete(&mut self) {
        let value = self.output.take();
        self.cell.resolve(Ok(value));
    }

    /// Complete with a failure.
    pub(crate) fn fail(&self, error: RedisError) {
        self.cell.resolve(Err(error));
    }
}

impl std::fmt::Debug for RedisCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCommand")
            .field("kind", &self.kind)
            .field("args", &self.args.len())
            .field("sent", &self.sent)
            .field("done", &self.cell.is_done())
            .finish()
    }
}
