//! # tcp-pubsub
//!
//! Embeddable publish/subscribe transport over TCP.
//!
//! A [`Publisher`] listens on a port and fans opaque byte payloads out to
//! every connected subscriber. A [`Subscriber`] keeps outbound connections
//! to one or more publishers, reconnects when they break, and hands each
//! received payload to a single user callback.
//!
//! ## Architecture
//!
//! - **Framing**: every message carries a self-describing 12-byte header;
//!   peers with shorter or longer headers still interoperate
//! - **Latest wins**: a slow subscriber never builds up a queue. At most one
//!   write is in flight per connection and only the newest pending message
//!   survives
//! - **Reconnection**: subscriber sessions retry on a fixed interval within
//!   a per-session budget that is restored whenever data arrives
//! - **Executor**: all socket work runs on a shared tokio worker pool
//!
//! ## Example
//!
//! ```no_run
//! use tcp_pubsub::{CallbackData, Executor, Publisher, Subscriber};
//!
//! let executor = Executor::new(4).unwrap();
//! let publisher = Publisher::bind(&executor, "127.0.0.1", 1588).unwrap();
//!
//! let subscriber = Subscriber::new(&executor);
//! subscriber.add_session("127.0.0.1", 1588);
//! subscriber
//!     .set_callback(|data: &CallbackData| println!("{:?}", data.payload()), true)
//!     .unwrap();
//!
//! publisher.send(b"Hello World").unwrap();
//! ```
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod publisher;
pub mod subscriber;
pub mod transport;

mod backpressure;
mod mailbox;

pub use buffer_pool::{BufferPool, PooledBuffer, SharedBuffer};
pub use config::{PublisherConfig, SubscriberConfig};
pub use error::{PubSubError, Result};
pub use executor::{Executor, SerialContext};
pub use publisher::Publisher;
pub use subscriber::{CallbackData, Subscriber, SubscriberSession};
