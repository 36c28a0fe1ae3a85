//! Integration tests for tcp-pubsub.
//!
//! Real publishers and subscribers on 127.0.0.1 with ephemeral ports.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tcp_pubsub::protocol::{build_frame, handshake_frame, Header, MessageType, HEADER_SIZE};
use tcp_pubsub::{CallbackData, Executor, PubSubError, Publisher, Subscriber};

/// Poll `condition` for up to five seconds.
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

fn collector() -> (Arc<Mutex<Vec<Vec<u8>>>>, impl Fn(&CallbackData) + Send + Sync) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    (received, move |data: &CallbackData| {
        sink.lock().push(data.payload().to_vec())
    })
}

/// Test end-to-end delivery in synchronous mode.
#[test]
fn test_ping_end_to_end() {
    let executor = Executor::new(4).unwrap();
    let publisher = Publisher::bind(&executor, "127.0.0.1", 0).unwrap();

    let subscriber = Subscriber::new(&executor);
    let (received, callback) = collector();
    subscriber.set_callback(callback, true).unwrap();
    let session = subscriber.add_session("127.0.0.1", publisher.port());

    assert!(wait_until(|| session.is_connected()));
    assert!(wait_until(|| publisher.subscriber_count() == 1));

    publisher.send(b"ping").unwrap();

    assert!(wait_until(|| !received.lock().is_empty()));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(*received.lock(), vec![b"ping".to_vec()]);
}

/// Test fan-out to several subscribers and multi-part payloads.
#[test]
fn test_fan_out_to_all_subscribers() {
    let executor = Executor::new(4).unwrap();
    let publisher = Publisher::bind(&executor, "127.0.0.1", 0).unwrap();

    let mut subscribers = Vec::new();
    let mut results = Vec::new();
    for _ in 0..3 {
        let subscriber = Subscriber::new(&executor);
        let (received, callback) = collector();
        subscriber.set_callback(callback, true).unwrap();
        let session = subscriber.add_session("127.0.0.1", publisher.port());
        assert!(wait_until(|| session.is_connected()));
        subscribers.push(subscriber);
        results.push(received);
    }
    assert!(wait_until(|| publisher.subscriber_count() == 3));

    publisher.send_parts(&[b"Hello ", b"", b"World"]).unwrap();

    for received in &results {
        assert!(wait_until(|| !received.lock().is_empty()));
        assert_eq!(received.lock()[0], b"Hello World");
    }
}

/// Test asynchronous delivery happens off the network threads.
#[test]
fn test_asynchronous_callback() {
    let executor = Executor::new(2).unwrap();
    let publisher = Publisher::bind(&executor, "127.0.0.1", 0).unwrap();

    let subscriber = Subscriber::new(&executor);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    subscriber
        .set_callback(
            move |data: &CallbackData| {
                let name = thread::current().name().map(str::to_string);
                let _ = tx.lock().send((data.payload().to_vec(), name));
            },
            false,
        )
        .unwrap();
    let session = subscriber.add_session("127.0.0.1", publisher.port());
    assert!(wait_until(|| session.is_connected()));

    publisher.send(b"async").unwrap();

    let (payload, thread_name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(payload, b"async");
    assert_eq!(thread_name.as_deref(), Some("tcp-pubsub-delivery"));
}

/// Test the publisher answers a raw handshake and then streams payloads.
#[test]
fn test_raw_handshake_gate() {
    let executor = Executor::new(2).unwrap();
    let publisher = Publisher::bind(&executor, "127.0.0.1", 0).unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", publisher.port())).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert!(wait_until(|| publisher.subscriber_count() == 1));

    // Nothing is written before the handshake.
    publisher.send(b"early").unwrap();
    stream.write_all(&handshake_frame()).unwrap();

    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).unwrap();
    let header = Header::decode(&header).unwrap();
    assert!(header.is_handshake());
    let mut version = vec![0u8; header.data_size as usize];
    stream.read_exact(&mut version).unwrap();
    assert_eq!(version, vec![0]);

    // The message parked during the handshake follows right after.
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).unwrap();
    let header = Header::decode(&header).unwrap();
    assert_eq!(header.kind(), Some(MessageType::RegularPayload));
    let mut payload = vec![0u8; header.data_size as usize];
    stream.read_exact(&mut payload).unwrap();
    assert_eq!(payload, b"early");
}

/// Test a subscriber that sends anything but a handshake is dropped.
#[test]
fn test_non_handshake_frame_closes_session() {
    let executor = Executor::new(2).unwrap();
    let publisher = Publisher::bind(&executor, "127.0.0.1", 0).unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", publisher.port())).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert!(wait_until(|| publisher.subscriber_count() == 1));

    stream
        .write_all(&build_frame(MessageType::RegularPayload, b"hi"))
        .unwrap();

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);
    assert!(wait_until(|| publisher.subscriber_count() == 0));
}

/// Test a subscriber disconnecting is removed from the publisher.
#[test]
fn test_subscriber_disconnect_updates_count() {
    let executor = Executor::new(2).unwrap();
    let publisher = Publisher::bind(&executor, "127.0.0.1", 0).unwrap();

    let subscriber = Subscriber::new(&executor);
    let session = subscriber.add_session("127.0.0.1", publisher.port());
    assert!(wait_until(|| session.is_connected()));
    assert!(wait_until(|| publisher.subscriber_count() == 1));

    drop(subscriber);

    assert!(wait_until(|| publisher.subscriber_count() == 0));
}

/// Test a subscriber reconnects after the publisher restarts on the same port.
#[test]
fn test_reconnect_after_publisher_restart() {
    let executor = Executor::new(4).unwrap();
    let publisher = Publisher::bind(&executor, "127.0.0.1", 0).unwrap();
    let port = publisher.port();

    let subscriber = Subscriber::with_config(
        &executor,
        tcp_pubsub::SubscriberConfig::default().reconnect_interval(Duration::from_millis(20)),
    );
    let (received, callback) = collector();
    subscriber.set_callback(callback, true).unwrap();
    let session = subscriber.add_session("127.0.0.1", port);
    assert!(wait_until(|| session.is_connected()));

    drop(publisher);
    assert!(wait_until(|| !session.is_connected()));

    // The old listener goes away asynchronously.
    let mut restarted = None;
    assert!(wait_until(|| {
        restarted = Publisher::bind(&executor, "127.0.0.1", port).ok();
        restarted.is_some()
    }));
    let publisher = restarted.unwrap();
    assert!(wait_until(|| session.is_connected()));
    assert!(session.connection_attempts() >= 2);

    publisher.send(b"again").unwrap();
    assert!(wait_until(|| !received.lock().is_empty()));
    assert_eq!(received.lock()[0], b"again");
}

/// Test start errors are reported, not raised.
#[test]
fn test_start_errors() {
    let executor = Executor::new(1).unwrap();
    let first = Publisher::bind(&executor, "127.0.0.1", 0).unwrap();

    let second = Publisher::new(&executor);
    let err = second.start("127.0.0.1", first.port()).unwrap_err();
    assert!(matches!(err, PubSubError::Bind { .. }));
    assert!(!second.is_running());

    let err = second.start("definitely not an address", 0).unwrap_err();
    assert!(matches!(err, PubSubError::AddressParse { .. }));
    assert!(err.to_string().contains("definitely not an address"));
}

/// Test a slow subscriber only sees the latest of a burst.
#[test]
fn test_slow_subscriber_gets_latest() {
    let executor = Executor::new(4).unwrap();
    let publisher = Publisher::bind(&executor, "127.0.0.1", 0).unwrap();

    let subscriber = Subscriber::new(&executor);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    subscriber
        .set_callback(
            move |data: &CallbackData| {
                thread::sleep(Duration::from_millis(20));
                sink.lock().push(data.payload().to_vec());
            },
            false,
        )
        .unwrap();
    let session = subscriber.add_session("127.0.0.1", publisher.port());
    assert!(wait_until(|| session.is_connected()));

    for i in 0..200u32 {
        publisher.send(format!("msg {}", i).as_bytes()).unwrap();
    }

    assert!(wait_until(|| {
        received.lock().last().map(Vec::as_slice) == Some(b"msg 199".as_slice())
    }));
    assert!(received.lock().len() < 200);
}
