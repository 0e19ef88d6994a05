//! Client options and endpoint addressing

use crate::error::{RedisError, RedisResult};
use std::time::Duration;

/// What happens to submissions while the connection is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectedBehavior {
    /// Accept commands into the buffer when auto-reconnect is enabled,
    /// reject otherwise
    #[default]
    Default,
    /// Always buffer commands while disconnected
    AcceptCommands,
    /// Always reject commands while disconnected
    RejectCommands,
}

/// Reconnect backoff policy.
///
/// Attempt `n` (1-indexed) waits `min(cap, base * 2^(n-1))` before dialing.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Compute the delay for the given 1-indexed attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
        delay.min(self.max_delay)
    }
}

/// Behavioral options for one endpoint.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Attempt to reconnect on channel loss
    pub auto_reconnect: bool,
    /// Fail all queued and buffered commands if the first reconnect
    /// attempt after a loss fails
    pub cancel_commands_on_reconnect_failure: bool,
    /// Stop reconnecting after observing a protocol-level failure during
    /// activation
    pub suspend_reconnect_on_protocol_failure: bool,
    /// Issue PING as the first command on every new channel and release the
    /// endpoint only on `+PONG`
    pub ping_before_activate_connection: bool,
    /// Hard upper bound on buffered plus in-flight commands
    pub request_queue_size: usize,
    /// Admission policy while disconnected
    pub disconnected_behavior: DisconnectedBehavior,
    /// Backoff policy for the connection watchdog
    pub reconnect: ReconnectPolicy,
    /// Default per-command timeout applied by the sync-style facade
    pub default_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            cancel_commands_on_reconnect_failure: false,
            suspend_reconnect_on_protocol_failure: false,
            ping_before_activate_connection: false,
            request_queue_size: usize::MAX,
            disconnected_behavior: DisconnectedBehavior::Default,
            reconnect: ReconnectPolicy::default(),
            default_timeout: Duration::from_secs(60 * 60),
        }
    }
}

impl ClientOptions {
    /// Enable or disable reconnect on channel loss.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Fail everything if the first reconnect attempt fails.
    pub fn cancel_commands_on_reconnect_failure(mut self, enabled: bool) -> Self {
        self.cancel_commands_on_reconnect_failure = enabled;
        self
    }

    /// Suspend reconnecting after a protocol failure during activation.
    pub fn suspend_reconnect_on_protocol_failure(mut self, enabled: bool) -> Self {
        self.suspend_reconnect_on_protocol_failure = enabled;
        self
    }

    /// Require a successful PING before the endpoint goes active.
    pub fn ping_before_activate_connection(mut self, enabled: bool) -> Self {
        self.ping_before_activate_connection = enabled;
        self
    }

    /// Bound the number of buffered plus in-flight commands.
    pub fn request_queue_size(mut self, size: usize) -> Self {
        self.request_queue_size = size;
        self
    }

    /// Set the admission policy while disconnected.
    pub fn disconnected_behavior(mut self, behavior: DisconnectedBehavior) -> Self {
        self.disconnected_behavior = behavior;
        self
    }

    /// Set the reconnect backoff policy.
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the default per-command timeout.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Address of one Redis endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisTarget {
    /// Plain TCP
    Tcp {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// TCP with TLS
    Tls {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Unix domain socket
    Unix {
        /// Socket path
        path: String,
    },
}

/// A parsed Redis endpoint URI.
///
/// Supported forms: `redis://[password@]host[:port][/db]`,
/// `rediss://[password@]host[:port][/db]` and `redis-socket:///path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisUrl {
    /// Where to connect
    pub target: RedisTarget,
    /// Password to send via AUTH during activation
    pub password: Option<String>,
    /// Database to SELECT during activation
    pub database: u32,
}

const DEFAULT_PORT: u16 = 6379;

impl RedisUrl {
    /// Parse an endpoint URI.
    pub fn parse(input: &str) -> RedisResult<Self> {
        let input = input.trim();

        if let Some(path) = input.strip_prefix("redis-socket://") {
            if path.is_empty() {
                return Err(RedisError::Config("empty unix socket path".to_string()));
            }
            return Ok(Self {
                target: RedisTarget::Unix {
                    path: path.to_string(),
                },
                password: None,
                database: 0,
            });
        }

        let (tls, rest) = if let Some(rest) = input.strip_prefix("rediss://") {
            (true, rest)
        } else if let Some(rest) = input.strip_prefix("redis://") {
            (false, rest)
        } else {
            return Err(RedisError::Config(format!(
                "unsupported URI scheme: {input}"
            )));
        };

        let (password, rest) = match rest.rsplit_once('@') {
            Some((auth, tail)) => {
                // allow the user:password form, only the password is used
                let pw = auth.rsplit_once(':').map_or(auth, |(_, pw)| pw);
                (Some(pw.to_string()), tail)
            }
            None => (None, rest),
        };

        let (addr, database) = match rest.split_once('/') {
            Some((addr, db)) if !db.is_empty() => {
                let db = db
                    .parse::<u32>()
                    .map_err(|e| RedisError::Config(format!("invalid database index: {e}")))?;
                (addr, db)
            }
            Some((addr, _)) => (addr, 0),
            None => (rest, 0),
        };

        if addr.is_empty() {
            return Err(RedisError::Config("missing host".to_string()));
        }

        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| RedisError::Config(format!("invalid port: {e}")))?;
                (host.to_string(), port)
            }
            None => (addr.to_string(), DEFAULT_PORT),
        };

        let target = if tls {
            RedisTarget::Tls { host, port }
        } else {
            RedisTarget::Tcp { host, port }
        };

        Ok(Self {
            target,
            password,
            database,
        })
    }

    /// Human-readable address for logging.
    pub fn address(&self) -> String {
        match &self.target {
            RedisTarget::Tcp { host, port } | RedisTarget::Tls { host, port } => {
                format!("{host}:{port}")
            }
            RedisTarget::Unix { path } => path.clone(),
        }
    }
}

/// Connection-level settings independent of endpoint behavior.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Parsed endpoint URI
    pub url: RedisUrl,
    /// Socket connect timeout
    pub connect_timeout: Duration,
    /// TCP keepalive interval, if enabled
    pub tcp_keepalive: Option<Duration>,
}

impl ConnectionConfig {
    /// Create a configuration from an endpoint URI.
    pub fn new(uri: impl AsRef<str>) -> RedisResult<Self> {
        Ok(Self {
            url: RedisUrl::parse(uri.as_ref())?,
            connect_timeout: Duration::from_secs(5),
            tcp_keepalive: Some(Duration::from_secs(60)),
        })
    }

    /// Set the socket connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable TCP keepalive.
    pub fn tcp_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.tcp_keepalive = interval;
        self
    }
}
