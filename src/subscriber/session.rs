//! Outbound connection to one publisher, with automatic reconnection.
//!
//! # Lifecycle
//!
//! ```text
//!            ┌──────────────────────── retry ◄──────────────────────┐
//!            ▼                                                      │
//! Resolving ──► Connecting ──► Handshaking ──► Running ──failure──► Reconnecting
//!     │              │              │             │                   │
//!     └──────────────┴──────────────┴─────────────┴── exhausted / cancel ──► Canceled
//! ```
//!
//! The whole lifecycle runs on one task, so steps of one connection never
//! overlap. Any failure (resolve, connect, handshake write, read, protocol
//! error) closes the socket and consults the retry budget.

use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::dispatcher::Dispatcher;
use super::retry::RetryBudget;
use crate::buffer_pool::BufferPool;
use crate::config::SubscriberConfig;
use crate::error::{PubSubError, Result};
use crate::protocol::{handshake_frame, Frame, FrameDecoder, HandshakeMessage, MessageType};
use crate::transport::{connect, describe_connection, resolve_preferring_loopback, set_nodelay};

/// Subscriber session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Resolving,
    Connecting,
    Handshaking,
    Running,
    Reconnecting,
    Canceled,
}

impl SessionState {
    /// Check if a transition is valid.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Canceled, _) => false,
            (_, Canceled) => true,
            (Resolving, Connecting) | (Connecting, Handshaking) | (Handshaking, Running) => true,
            (Resolving | Connecting | Handshaking | Running, Reconnecting) => true,
            (Reconnecting, Resolving) => true,
            _ => false,
        }
    }
}

/// Called exactly once when the session gives up or is canceled.
pub(crate) type ClosedHandler = Box<dyn FnOnce(&SubscriberSession) + Send>;

struct SessionInner {
    address: String,
    port: u16,
    state: Mutex<SessionState>,
    budget: Mutex<RetryBudget>,
    attempts: AtomicU64,
    cancel: CancellationToken,
    config: SubscriberConfig,
    pool: BufferPool,
    dispatcher: Arc<Dispatcher>,
    on_closed: Mutex<Option<ClosedHandler>>,
}

/// Handle to one outbound connection.
///
/// Cheap to clone; clones refer to the same session and compare equal.
#[derive(Clone)]
pub struct SubscriberSession {
    inner: Arc<SessionInner>,
}

impl SubscriberSession {
    pub(crate) fn new(
        address: &str,
        port: u16,
        max_reconnection_attempts: i32,
        config: SubscriberConfig,
        pool: BufferPool,
        dispatcher: Arc<Dispatcher>,
        on_closed: ClosedHandler,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                address: address.to_string(),
                port,
                state: Mutex::new(SessionState::Resolving),
                budget: Mutex::new(RetryBudget::new(max_reconnection_attempts)),
                attempts: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                config,
                pool,
                dispatcher,
                on_closed: Mutex::new(Some(on_closed)),
            }),
        }
    }

    /// Spawn the session task.
    pub(crate) fn start(&self, handle: &Handle) {
        let session = self.clone();
        handle.spawn(async move { session.run().await });
    }

    async fn run(self) {
        loop {
            let error = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => PubSubError::Canceled,
                result = self.connect_and_receive() => match result {
                    Ok(never) => match never {},
                    Err(e) => e,
                },
            };

            if !self.should_retry(&error) {
                break;
            }

            let interval = self.inner.config.reconnect_interval;
            tracing::info!(
                "SubscriberSession {}: Reconnecting in {} ms",
                self.target(),
                interval.as_millis()
            );
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.advance(SessionState::Resolving) {
                tracing::warn!("SubscriberSession {}: {}", self.target(), e);
                break;
            }
        }

        self.close();
    }

    /// Log a failure and decide whether to try again.
    fn should_retry(&self, error: &PubSubError) -> bool {
        if error.is_canceled() || self.inner.cancel.is_cancelled() {
            tracing::debug!("SubscriberSession {}: Canceled", self.target());
            return false;
        }
        match error {
            PubSubError::ConnectionClosed => tracing::info!(
                "SubscriberSession {}: Connection closed by publisher",
                self.target()
            ),
            e => tracing::warn!("SubscriberSession {}: {}", self.target(), e),
        }

        let mut budget = self.inner.budget.lock();
        if !budget.try_consume() {
            tracing::info!(
                "SubscriberSession {}: Giving up, no reconnection attempts left",
                self.target()
            );
            return false;
        }
        drop(budget);

        self.advance(SessionState::Reconnecting).is_ok()
    }

    /// One connection, from resolution to the receive loop. Only returns on
    /// failure; the socket closes when the stream is dropped.
    async fn connect_and_receive(&self) -> Result<Infallible> {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);

        let endpoint = resolve_preferring_loopback(&self.inner.address, self.inner.port).await?;
        self.advance(SessionState::Connecting)?;
        tracing::debug!("SubscriberSession {}: Connecting to {}", self.target(), endpoint);

        let mut stream = connect(endpoint).await?;
        let description = format!("SubscriberSession {}", describe_connection(&stream));
        set_nodelay(&stream, &description);

        self.advance(SessionState::Handshaking)?;
        stream
            .write_all(&handshake_frame())
            .await
            .map_err(PubSubError::Write)?;
        tracing::debug!("{}: Sent handshake request", description);

        self.receive(&mut stream, &description).await
    }

    async fn receive(&self, stream: &mut TcpStream, description: &str) -> Result<Infallible> {
        let mut decoder = FrameDecoder::with_max_payload(
            self.inner.pool.clone(),
            self.inner.config.max_payload_size,
        );
        let mut buf = vec![0u8; self.inner.config.read_buffer_size.max(1)];

        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => return Err(PubSubError::ConnectionClosed),
                Ok(n) => n,
                Err(e) => return Err(PubSubError::Read(e)),
            };

            for frame in decoder.push(&buf[..n])? {
                self.handle_frame(frame, description)?;
            }
        }
    }

    fn handle_frame(&self, frame: Frame, description: &str) -> Result<()> {
        // Any frame proves the publisher is alive.
        self.inner.budget.lock().reset();

        match frame.kind() {
            Some(MessageType::ProtocolHandshake) => {
                if self.state() == SessionState::Running {
                    tracing::debug!("{}: Ignoring repeated handshake response", description);
                    return Ok(());
                }
                let response = HandshakeMessage::decode(frame.payload());
                self.advance(SessionState::Running)?;
                tracing::info!(
                    "{}: Connected (protocol version {})",
                    description,
                    response.protocol_version
                );
            }
            Some(MessageType::RegularPayload) => {
                if !frame.payload().is_empty() {
                    self.inner.dispatcher.deliver(frame.payload);
                }
            }
            None => {
                tracing::warn!(
                    "{}: Received message of unknown type {}, skipping",
                    description,
                    frame.header.message_type
                );
            }
        }
        Ok(())
    }

    /// Enter `Canceled` and fire the closed notification once.
    fn close(&self) {
        *self.inner.state.lock() = SessionState::Canceled;
        let handler = self.inner.on_closed.lock().take();
        if let Some(handler) = handler {
            handler(self);
        }
    }

    fn advance(&self, next: SessionState) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.can_transition_to(next) {
            return Err(PubSubError::Protocol(format!(
                "Invalid session state transition {:?} -> {:?}",
                *state, next
            )));
        }
        *state = next;
        Ok(())
    }

    fn target(&self) -> String {
        format!("{}:{}", self.inner.address, self.inner.port)
    }

    /// Host name or address this session connects to.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// True once the publisher answered the handshake, until the connection
    /// is lost.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Number of connection attempts made so far.
    pub fn connection_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Stop the session. The closed notification follows from the session
    /// task. Idempotent.
    pub fn cancel(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == SessionState::Canceled {
                return;
            }
            *state = SessionState::Canceled;
        }
        tracing::debug!("SubscriberSession {}: Canceling session", self.target());
        self.inner.cancel.cancel();
    }
}

impl PartialEq for SubscriberSession {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SubscriberSession {}

impl fmt::Debug for SubscriberSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberSession")
            .field("target", &self.target())
            .field("state", &self.state())
            .field("attempts", &self.connection_attempts())
            .finish()
    }
}
