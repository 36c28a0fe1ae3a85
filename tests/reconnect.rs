//! Reconnection budget tests against a port nobody listens on.

use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use tcp_pubsub::subscriber::SessionState;
use tcp_pubsub::{Executor, Subscriber, SubscriberConfig};

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Port of a listener that has already been closed.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn fast_retry_subscriber(executor: &Executor) -> Subscriber {
    Subscriber::with_config(
        executor,
        SubscriberConfig::default().reconnect_interval(Duration::from_millis(10)),
    )
}

#[test]
fn test_zero_attempts_tries_once() {
    let executor = Executor::new(2).unwrap();
    let subscriber = fast_retry_subscriber(&executor);

    let session = subscriber.add_session_with_attempts("127.0.0.1", closed_port(), 0);

    assert!(wait_until(|| subscriber.sessions().is_empty()));
    assert_eq!(session.connection_attempts(), 1);
    assert_eq!(session.state(), SessionState::Canceled);
}

#[test]
fn test_two_attempts_tries_three_times() {
    let executor = Executor::new(2).unwrap();
    let subscriber = fast_retry_subscriber(&executor);

    let session = subscriber.add_session_with_attempts("127.0.0.1", closed_port(), 2);

    assert!(wait_until(|| subscriber.sessions().is_empty()));
    assert_eq!(session.connection_attempts(), 3);
}

#[test]
fn test_unlimited_attempts_keep_going_until_canceled() {
    let executor = Executor::new(2).unwrap();
    let subscriber = fast_retry_subscriber(&executor);

    let session = subscriber.add_session_with_attempts("127.0.0.1", closed_port(), -1);

    assert!(wait_until(|| session.connection_attempts() >= 5));
    assert_eq!(subscriber.sessions(), vec![session.clone()]);
    assert!(!session.is_connected());

    session.cancel();

    assert!(wait_until(|| subscriber.sessions().is_empty()));
    let attempts = session.connection_attempts();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(session.connection_attempts(), attempts);
}

#[test]
fn test_default_budget_comes_from_config() {
    let executor = Executor::new(2).unwrap();
    let subscriber = Subscriber::with_config(
        &executor,
        SubscriberConfig::default()
            .reconnect_interval(Duration::from_millis(10))
            .max_reconnection_attempts(1),
    );

    let session = subscriber.add_session("127.0.0.1", closed_port());

    assert!(wait_until(|| subscriber.sessions().is_empty()));
    assert_eq!(session.connection_attempts(), 2);
}
