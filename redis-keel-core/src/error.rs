//! Error types for Redis operations

use std::io;
use thiserror::Error;

/// Result type for Redis operations
pub type RedisResult<T> = Result<T, RedisError>;

/// The reason a command was cancelled before a reply arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled the command explicitly
    Explicit,
    /// The channel was lost while the command was in flight (at-most-once mode)
    Disconnected,
    /// The endpoint was closed
    ClientClosed,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "cancelled by caller"),
            Self::Disconnected => write!(f, "connection lost before a reply arrived"),
            Self::ClientClosed => write!(f, "client closed"),
        }
    }
}

/// Comprehensive error type for Redis operations
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server replied with an error (`-ERR ...`)
    #[error("Server error: {0}")]
    Server(String),

    /// Argument encoding failed; the command never reached the wire
    #[error("Encode error: {0}")]
    Encode(String),

    /// The output decoder rejected a valid-on-the-wire reply
    #[error("Decode error: {0}")]
    Decode(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Command cancelled before completion
    #[error("Command cancelled: {0}")]
    Cancelled(CancelReason),

    /// Submission rejected because the endpoint is closed
    #[error("Client is closed")]
    ClientClosed,

    /// Submission rejected because the request queue is full
    #[error("Request queue size of {0} exceeded")]
    QueueOverflow(usize),

    /// Submission rejected while disconnected
    #[error("Commands are rejected while the connection is down")]
    RejectedWhileDisconnected,

    /// Reconnect attempts were exhausted or suspended
    #[error("Reconnect failed after {attempts} attempt(s): {last_error}")]
    ReconnectFailed {
        /// Number of attempts made before giving up
        attempts: u32,
        /// Description of the last connect failure
        last_error: String,
    },

    /// Authentication rejected during connection activation; fatal
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Null or otherwise invalid argument
    #[error("Invalid argument: {0}")]
    Validation(String),

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    Type(String),
}

impl RedisError {
    /// Check whether this error carries a server reply rather than a
    /// client-side failure.
    pub fn is_server_error(&self) -> bool {
        matches!(self, RedisError::Server(_))
    }

    /// Check whether this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RedisError::Cancelled(_))
    }

    /// Errors that terminate the endpoint instead of a single command.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RedisError::Auth(_))
    }

    /// Copy this error for fanning one failure out to many commands.
    /// `io::Error` is not `Clone`, so IO errors degrade to their message.
    pub fn duplicate(&self) -> RedisError {
        match self {
            RedisError::Io(e) => RedisError::Connection(e.to_string()),
            RedisError::Protocol(s) => RedisError::Protocol(s.clone()),
            RedisError::Server(s) => RedisError::Server(s.clone()),
            RedisError::Encode(s) => RedisError::Encode(s.clone()),
            RedisError::Decode(s) => RedisError::Decode(s.clone()),
            RedisError::Connection(s) => RedisError::Connection(s.clone()),
            RedisError::Timeout => RedisError::Timeout,
            RedisError::Cancelled(r) => RedisError::Cancelled(*r),
            RedisError::ClientClosed => RedisError::ClientClosed,
            RedisError::QueueOverflow(n) => RedisError::QueueOverflow(*n),
            RedisError::RejectedWhileDisconnected => RedisError::RejectedWhileDisconnected,
            RedisError::ReconnectFailed {
                attempts,
                last_error,
            } => RedisError::ReconnectFailed {
                attempts: *attempts,
                last_error: last_error.clone(),
            },
            RedisError::Auth(s) => RedisError::Auth(s.clone()),
            RedisError::Config(s) => RedisError::Config(s.clone()),
            RedisError::Validation(s) => RedisError::Validation(s.clone()),
            RedisError::Type(s) => RedisError::Type(s.clone()),
        }
    }
}
