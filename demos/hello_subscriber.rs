//! Hello World subscriber.
//!
//! Connects to a publisher on localhost:1588 and prints every payload.
//!
//! ```text
//! RUST_LOG=info cargo run --example hello_subscriber
//! ```

use std::thread;
use std::time::Duration;

use tcp_pubsub::{CallbackData, Executor, Subscriber};
use tracing_subscriber::EnvFilter;

const PORT: u16 = 1588;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let executor = Executor::new(6)?;
    let subscriber = Subscriber::new(&executor);
    subscriber.add_session("localhost", PORT);

    subscriber.set_callback(
        |data: &CallbackData| {
            println!("Received message: {}", String::from_utf8_lossy(data.payload()));
        },
        false,
    )?;

    loop {
        thread::sleep(Duration::from_millis(500));
    }
}
