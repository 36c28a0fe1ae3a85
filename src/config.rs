//! Tunables for publishers and subscribers.
//!
//! Both configs deserialize with every field optional, so a partial JSON or
//! TOML document only overrides what it names. Durations are expressed in
//! milliseconds on the wire.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tcp_pubsub::SubscriberConfig;
//!
//! let config = SubscriberConfig::default()
//!     .reconnect_interval(Duration::from_millis(250))
//!     .max_reconnection_attempts(5);
//! assert_eq!(config.default_max_reconnection_attempts, 5);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;

/// Default pending-connection queue length of the listening socket.
pub const DEFAULT_LISTEN_BACKLOG: u32 = 1024;

/// Default size of a single socket read (64KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default pause between a failed connection and the next attempt.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Default reconnection budget: negative means retry forever.
pub const DEFAULT_MAX_RECONNECTION_ATTEMPTS: i32 = -1;

/// Publisher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Backlog passed to `listen()`.
    pub listen_backlog: u32,
    /// Largest frame accepted from a subscriber.
    pub max_payload_size: u64,
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl PublisherConfig {
    pub fn listen_backlog(mut self, backlog: u32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    pub fn max_payload_size(mut self, size: u64) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }
}

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Wait between a connection failure and the next attempt.
    #[serde(rename = "reconnect_interval_ms", with = "duration_ms")]
    pub reconnect_interval: Duration,
    /// Budget used by [`Subscriber::add_session`](crate::Subscriber::add_session).
    pub default_max_reconnection_attempts: i32,
    /// Largest frame accepted from a publisher.
    pub max_payload_size: u64,
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            default_max_reconnection_attempts: DEFAULT_MAX_RECONNECTION_ATTEMPTS,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl SubscriberConfig {
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the default budget: `-1` retries forever, `0` never retries.
    pub fn max_reconnection_attempts(mut self, attempts: i32) -> Self {
        self.default_max_reconnection_attempts = attempts;
        self
    }

    pub fn max_payload_size(mut self, size: u64) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
