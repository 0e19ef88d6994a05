//! Reliable asynchronous Redis client core
//!
//! `redis-keel` implements the hard part of a Redis client: one buffered
//! endpoint per server, an in-flight command queue matched reply-by-reply
//! against the wire, a reconnect watchdog with exponential backoff, and
//! session restoration (AUTH, SELECT and pub/sub subscriptions) that runs
//! before user traffic resumes after every reconnect.
//!
//! With auto-reconnect enabled the client delivers commands at least once
//! across transient connection failures: commands written but unanswered
//! when the channel drops are transparently rewritten after the channel
//! comes back. With auto-reconnect disabled the same commands are cancelled
//! instead, for at-most-once delivery.
//!
//! # Quick start
//!
//! ```no_run
//! use redis_keel::{ConnectionConfig, RedisClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::new("redis://localhost:6379")?;
//!     let connection = RedisClient::new(config).connect().await?;
//!
//!     connection.set("mykey", "myvalue").await?;
//!     let value = connection.get("mykey").await?;
//!     println!("Value: {value:?}");
//!
//!     Ok(())
//! }
//! ```

#![deny(warnings)]
#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]

mod activation;
pub mod client;
pub mod codec;
pub mod command;
pub mod endpoint;
pub mod events;
mod handler;
pub mod protocol;
pub mod pubsub;
pub mod transport;
pub mod watchdog;

pub use client::{Connection, PubSubConnection, RedisClient};
pub use codec::{KeyValueCodec, Utf8Codec};
pub use command::{AsyncCommand, CommandArgs, CommandKind, CommandOutput, RedisCommand};
pub use endpoint::{Endpoint, LifecycleState, QueueSnapshot};
pub use events::ConnectionEvent;
pub use pubsub::{MessageStream, PubSubEvent, PubSubMessage};
pub use transport::{BoxedStream, ChannelStream, Connector};
pub use watchdog::ConnectionWatchdog;

pub use redis_keel_core::{
    CancelReason, ClientOptions, ClientResources, ConnectionConfig, DisconnectedBehavior,
    ReconnectPolicy, RedisError, RedisResult, RedisTarget, RedisUrl, RespValue,
};
