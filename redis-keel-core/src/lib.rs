//! Foundation types for the `redis-keel` client: configuration, the error
//! taxonomy, RESP reply values and shared client resources.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod resources;
pub mod value;

pub use config::{
    ClientOptions, ConnectionConfig, DisconnectedBehavior, ReconnectPolicy, RedisTarget, RedisUrl,
};
pub use error::{CancelReason, RedisError, RedisResult};
pub use resources::ClientResources;
pub use value::RespValue;
