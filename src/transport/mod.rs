//! Transport module - TCP listener and connection setup.
//!
//! Provides:
//! - Listening socket creation with address reuse (publisher)
//! - Name resolution with loopback preference and connect (subscriber)

mod tcp;

pub use tcp::{
    bind_listener, connect, describe_connection, resolve_preferring_loopback, set_nodelay,
};
