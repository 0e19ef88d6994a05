//! Client facade
//!
//! [`RedisClient`] wires an endpoint, a watchdog and a transport together
//! and hands out connections. The typed command methods here are a thin
//! layer: they encode arguments, submit a command descriptor to the
//! endpoint and await the future. The interesting machinery lives in the
//! endpoint, handler and watchdog modules.

use crate::codec::Utf8Codec;
use crate::command::{
    AsyncCommand, CommandArgs, CommandKind, CommandOutput, IntegerOutput, RedisCommand,
    StatusOutput, ValueOutput,
};
use crate::endpoint::{Endpoint, EndpointMode, LifecycleState, QueueSnapshot};
use crate::events::ConnectionEvent;
use crate::handler;
use crate::pubsub::{MessageStream, PubSubEvent, PubSubMessage, SubscriptionDispatcher};
use crate::transport::{connector_for, Connector};
use crate::watchdog::ConnectionWatchdog;
use redis_keel_core::{
    config::{ClientOptions, ConnectionConfig},
    error::{RedisError, RedisResult},
    resources::ClientResources,
    value::RespValue,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Entry point: builds connections to one Redis endpoint.
#[derive(Clone)]
pub struct RedisClient {
    resources: ClientResources,
    config: ConnectionConfig,
    options: ClientOptions,
}

impl RedisClient {
    /// Create a client with default options and resources.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            resources: ClientResources::default(),
            config,
            options: ClientOptions::default(),
        }
    }

    /// Replace the endpoint options.
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Share client-wide resources across clients.
    pub fn with_resources(mut self, resources: ClientResources) -> Self {
        self.resources = resources;
        self
    }

    /// Connect using the built-in transport for the configured URI.
    pub async fn connect(&self) -> RedisResult<Connection> {
        self.connect_with(connector_for(&self.config)?).await
    }

    /// Connect through a caller-supplied transport.
    pub async fn connect_with(&self, connector: Arc<dyn Connector>) -> RedisResult<Connection> {
        let endpoint = Endpoint::new(
            self.options.clone(),
            self.config.url.clone(),
            &self.resources,
            EndpointMode::Command,
            None,
        );
        self.establish(endpoint, connector).await
    }

    /// Connect a pub/sub session using the built-in transport.
    pub async fn connect_pubsub(&self) -> RedisResult<PubSubConnection> {
        self.connect_pubsub_with(connector_for(&self.config)?).await
    }

    /// Connect a pub/sub session through a caller-supplied transport.
    pub async fn connect_pubsub_with(
        &self,
        connector: Arc<dyn Connector>,
    ) -> RedisResult<PubSubConnection> {
        let (dispatcher, messages) = SubscriptionDispatcher::pair();
        let endpoint = Endpoint::new(
            self.options.clone(),
            self.config.url.clone(),
            &self.resources,
            EndpointMode::PubSub,
            Some(dispatcher),
        );
        let connection = self.establish(endpoint, connector).await?;
        Ok(PubSubConnection {
            connection,
            messages,
        })
    }

    async fn establish(
        &self,
        endpoint: Arc<Endpoint>,
        connector: Arc<dyn Connector>,
    ) -> RedisResult<Connection> {
        info!("connecting to redis at {}", self.config.url.address());
        let watchdog = ConnectionWatchdog::new(Arc::clone(&endpoint), Arc::clone(&connector));

        let stream = connector.connect().await?;
        handler::install(Arc::clone(&endpoint), Arc::clone(&watchdog), stream).await?;

        Ok(Connection {
            endpoint,
            watchdog,
            codec: Utf8Codec,
            timeout: self.options.default_timeout,
        })
    }
}

/// A live connection to one Redis endpoint. Cloneable and usable from any
/// task; command submission never blocks.
#[derive(Clone)]
pub struct Connection {
    endpoint: Arc<Endpoint>,
    watchdog: Arc<ConnectionWatchdog>,
    codec: Utf8Codec,
    timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Submit a prepared command descriptor.
    pub fn write(&self, command: RedisCommand) -> AsyncCommand {
        self.endpoint.write(command)
    }

    /// Submit a command built from possibly-failing argument encoding. An
    /// encoding failure resolves the future synchronously; the connection
    /// never sees the command.
    pub fn write_command(
        &self,
        kind: CommandKind,
        args: RedisResult<CommandArgs>,
        output: Box<dyn CommandOutput>,
    ) -> AsyncCommand {
        match args {
            Ok(args) => self.endpoint.write(RedisCommand::new(kind, args, output)),
            Err(e) => {
                let command = RedisCommand::new(kind, CommandArgs::new(), output);
                let handle = command.handle();
                let error = match e {
                    e @ RedisError::Encode(_) => e,
                    other => RedisError::Encode(other.to_string()),
                };
                command.fail(error);
                handle
            }
        }
    }

    async fn call(
        &self,
        kind: CommandKind,
        args: RedisResult<CommandArgs>,
        output: Box<dyn CommandOutput>,
    ) -> RedisResult<RespValue> {
        self.write_command(kind, args, output)
            .await_reply_timeout(self.timeout)
            .await
    }

    /// `SET key value`.
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> RedisResult<()> {
        let args = CommandArgs::new()
            .key(&self.codec, &key.into())
            .and_then(|args| args.value(&self.codec, &value.into()));
        self.call(CommandKind::Set, args, Box::new(StatusOutput::default()))
            .await?;
        Ok(())
    }

    /// `GET key`.
    pub async fn get(&self, key: impl Into<String>) -> RedisResult<Option<String>> {
        let args = CommandArgs::new().key(&self.codec, &key.into());
        let reply = self
            .call(CommandKind::Get, args, Box::new(ValueOutput::default()))
            .await?;
        match reply {
            RespValue::Null => Ok(None),
            other => Ok(Some(other.into_string()?)),
        }
    }

    /// `DEL key [key ...]`; returns the number of keys removed.
    pub async fn del(&self, keys: Vec<String>) -> RedisResult<i64> {
        if keys.is_empty() {
            return Err(RedisError::Validation("DEL requires at least one key".into()));
        }
        let mut args = Ok(CommandArgs::new());
        for key in &keys {
            args = args.and_then(|a| a.key(&self.codec, key));
        }
        let reply = self
            .call(CommandKind::Del, args, Box::new(IntegerOutput::default()))
            .await?;
        reply.as_integer()
    }

    /// `INCR key`; returns the incremented value.
    pub async fn incr(&self, key: impl Into<String>) -> RedisResult<i64> {
        let args = CommandArgs::new().key(&self.codec, &key.into());
        let reply = self
            .call(CommandKind::Incr, args, Box::new(IntegerOutput::default()))
            .await?;
        reply.as_integer()
    }

    /// `PING`; succeeds on `+PONG`.
    pub async fn ping(&self) -> RedisResult<()> {
        let reply = self
            .call(
                CommandKind::Ping,
                Ok(CommandArgs::new()),
                Box::new(ValueOutput::default()),
            )
            .await?;
        match reply {
            RespValue::Simple(ref pong) if pong == "PONG" => Ok(()),
            other => Err(RedisError::Protocol(format!(
                "unexpected PING reply: {other:?}"
            ))),
        }
    }

    /// `PUBLISH channel message`; returns the number of receivers.
    pub async fn publish(
        &self,
        channel: impl Into<String>,
        message: impl Into<String>,
    ) -> RedisResult<i64> {
        let args = CommandArgs::new()
            .key(&self.codec, &channel.into())
            .and_then(|args| args.value(&self.codec, &message.into()));
        let reply = self
            .call(CommandKind::Publish, args, Box::new(IntegerOutput::default()))
            .await?;
        reply.as_integer()
    }

    /// `QUIT`: ask the server to close this connection. The channel going
    /// away afterwards drives the regular disconnect machinery.
    pub async fn quit(&self) -> RedisResult<()> {
        self.call(
            CommandKind::Quit,
            Ok(CommandArgs::new()),
            Box::new(StatusOutput::default()),
        )
        .await?;
        Ok(())
    }

    /// Batch submissions until [`Connection::flush_commands`].
    pub fn set_auto_flush(&self, enabled: bool) {
        self.endpoint.set_auto_flush(enabled);
    }

    /// Write out everything buffered so far.
    pub fn flush_commands(&self) {
        self.endpoint.flush_commands();
    }

    /// `true` while the connection accepts writes to the wire.
    pub fn is_open(&self) -> bool {
        self.endpoint.is_open()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.endpoint.state()
    }

    /// Counts of buffered and in-flight commands.
    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.endpoint.queue_snapshot()
    }

    /// Subscribe to connection events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.endpoint.events()
    }

    /// The reconnect watchdog for this connection.
    pub fn watchdog(&self) -> &Arc<ConnectionWatchdog> {
        &self.watchdog
    }

    /// The underlying endpoint, the channel-writer half of this connection.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Close the connection, cancelling everything pending.
    pub fn close(&self) {
        self.endpoint.close();
    }
}

/// A pub/sub session. Subscriptions survive reconnects: the session
/// restorer replays them before the connection goes active again.
pub struct PubSubConnection {
    connection: Connection,
    messages: MessageStream,
}

impl PubSubConnection {
    /// `SUBSCRIBE channel [channel ...]`, awaiting every acknowledgement.
    pub async fn subscribe(&self, channels: Vec<String>) -> RedisResult<()> {
        self.subscription_change(CommandKind::Subscribe, channels)
            .await
    }

    /// `UNSUBSCRIBE channel [channel ...]`.
    pub async fn unsubscribe(&self, channels: Vec<String>) -> RedisResult<()> {
        self.subscription_change(CommandKind::Unsubscribe, channels)
            .await
    }

    /// `PSUBSCRIBE pattern [pattern ...]`, awaiting every acknowledgement.
    pub async fn psubscribe(&self, patterns: Vec<String>) -> RedisResult<()> {
        self.subscription_change(CommandKind::Psubscribe, patterns)
            .await
    }

    /// `PUNSUBSCRIBE pattern [pattern ...]`.
    pub async fn punsubscribe(&self, patterns: Vec<String>) -> RedisResult<()> {
        self.subscription_change(CommandKind::Punsubscribe, patterns)
            .await
    }

    async fn subscription_change(
        &self,
        kind: CommandKind,
        names: Vec<String>,
    ) -> RedisResult<()> {
        if names.is_empty() {
            return Err(RedisError::Validation(format!(
                "{kind} requires at least one name"
            )));
        }
        let mut args = Ok(CommandArgs::new());
        for name in &names {
            args = args.and_then(|a| a.key(&self.connection.codec, name));
        }
        let output = crate::pubsub::SubscriptionOutput::new(names.len());
        self.connection
            .call(kind, args, Box::new(output))
            .await?;
        Ok(())
    }

    /// Receive the next pub/sub event (messages and subscription changes).
    pub async fn next_event(&mut self) -> Option<PubSubEvent> {
        self.messages.recv().await
    }

    /// Receive the next published message, skipping subscription events.
    pub async fn next_message(&mut self) -> Option<PubSubMessage> {
        self.messages.next_message().await
    }

    /// The event stream itself, for `futures_util::Stream` composition.
    pub fn messages(&mut self) -> &mut MessageStream {
        &mut self.messages
    }

    /// Channels currently subscribed.
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.connection
            .endpoint
            .subscriptions()
            .channels()
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }

    /// Patterns currently subscribed.
    pub fn subscribed_patterns(&self) -> Vec<String> {
        self.connection
            .endpoint
            .subscriptions()
            .patterns()
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    /// `true` while the session accepts writes to the wire.
    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.connection.state()
    }

    /// Subscribe to connection events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.events()
    }

    /// The reconnect watchdog for this session.
    pub fn watchdog(&self) -> &Arc<ConnectionWatchdog> {
        self.connection.watchdog()
    }

    /// `QUIT`: ask the server to close this session.
    pub async fn quit(&self) -> RedisResult<()> {
        self.connection.quit().await
    }

    /// Close the session, cancelling everything pending.
    pub fn close(&self) {
        self.connection.close();
    }
}
