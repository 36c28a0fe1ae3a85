//! Hello World publisher.
//!
//! Publishes "Hello World N" every 500 ms on port 1588.
//!
//! ```text
//! RUST_LOG=info cargo run --example hello_publisher
//! ```

use std::thread;
use std::time::Duration;

use tcp_pubsub::{Executor, Publisher};
use tracing_subscriber::EnvFilter;

const PORT: u16 = 1588;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let executor = Executor::new(6)?;
    let publisher = Publisher::bind_any(&executor, PORT)?;

    let mut counter = 0u64;
    loop {
        counter += 1;
        let message = format!("Hello World {}", counter);
        println!("Sending message {}", message);
        publisher.send(message.as_bytes())?;

        thread::sleep(Duration::from_millis(500));
    }
}
