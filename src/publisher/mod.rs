//! Publisher: accepts subscribers and fans payloads out to all of them.
//!
//! # Example
//!
//! ```no_run
//! use tcp_pubsub::{Executor, Publisher};
//!
//! let executor = Executor::new(4).unwrap();
//! let publisher = Publisher::bind_any(&executor, 1588).unwrap();
//!
//! publisher.send(b"Hello World").unwrap();
//! ```

mod session;

pub use session::{PublisherSession, SessionState};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::buffer_pool::BufferPool;
use crate::config::PublisherConfig;
use crate::error::{PubSubError, Result};
use crate::executor::Executor;
use crate::protocol::{encode_frame_into, MessageType};
use crate::transport::bind_listener;

/// Address used by [`Publisher::bind_any`].
pub const ANY_ADDRESS: &str = "0.0.0.0";

/// Pause after a failed `accept()` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Shared state of a publisher, referenced by the accept loop.
struct PublisherInner {
    handle: Handle,
    config: PublisherConfig,
    pool: BufferPool,
    running: AtomicBool,
    local_endpoint: Mutex<Option<SocketAddr>>,
    sessions: Mutex<Vec<Arc<PublisherSession>>>,
    cancel: CancellationToken,
}

impl PublisherInner {
    fn endpoint(&self) -> String {
        match *self.local_endpoint.lock() {
            Some(endpoint) => endpoint.to_string(),
            None => "<unbound>".to_string(),
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Publisher {}: Accepted connection from {}", self.endpoint(), peer);
                    self.start_session(stream);
                }
                Err(e) => {
                    tracing::error!(
                        "Publisher {}: Error while waiting for subscriber: {}",
                        self.endpoint(),
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            }
        }
        tracing::debug!("Publisher {}: Stopped accepting subscribers", self.endpoint());
    }

    fn start_session(self: &Arc<Self>, stream: tokio::net::TcpStream) {
        let owner: Weak<PublisherInner> = Arc::downgrade(self);
        let session = PublisherSession::new(
            stream,
            self.handle.clone(),
            self.pool.clone(),
            self.config.clone(),
            Box::new(move |closed| {
                if let Some(owner) = owner.upgrade() {
                    owner.remove_session(closed);
                }
            }),
        );

        // Listed before it starts, so an immediate close finds itself.
        let count = {
            let mut sessions = self.sessions.lock();
            sessions.push(session.clone());
            sessions.len()
        };
        tracing::info!(
            "Publisher {}: Subscriber {} connected. Current subscriber count: {}",
            self.endpoint(),
            session.description(),
            count
        );

        // A cancel racing with the accept must not leave a live session.
        if self.cancel.is_cancelled() {
            session.cancel();
            return;
        }
        session.start();
    }

    fn remove_session(&self, closed: &Arc<PublisherSession>) {
        let count = {
            let mut sessions = self.sessions.lock();
            sessions.retain(|session| !Arc::ptr_eq(session, closed));
            sessions.len()
        };
        tracing::info!(
            "Publisher {}: Subscriber {} disconnected. Current subscriber count: {}",
            self.endpoint(),
            closed.description(),
            count
        );
    }
}

/// A listening publisher.
///
/// Dropping the publisher cancels it.
pub struct Publisher {
    // Keeps the worker pool alive for as long as the publisher exists.
    _executor: Executor,
    inner: Arc<PublisherInner>,
}

impl Publisher {
    /// Create an unbound publisher; call [`start`](Self::start) next.
    pub fn new(executor: &Executor) -> Self {
        Self::with_config(executor, PublisherConfig::default())
    }

    pub fn with_config(executor: &Executor, config: PublisherConfig) -> Self {
        Self {
            _executor: executor.clone(),
            inner: Arc::new(PublisherInner {
                handle: executor.handle().clone(),
                config,
                pool: BufferPool::new(),
                running: AtomicBool::new(false),
                local_endpoint: Mutex::new(None),
                sessions: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Create and start a publisher on `address:port`.
    pub fn bind(executor: &Executor, address: &str, port: u16) -> Result<Self> {
        let publisher = Self::new(executor);
        publisher.start(address, port)?;
        Ok(publisher)
    }

    /// Create and start a publisher on all interfaces.
    pub fn bind_any(executor: &Executor, port: u16) -> Result<Self> {
        Self::bind(executor, ANY_ADDRESS, port)
    }

    /// Bind, listen and start accepting subscribers.
    ///
    /// Port 0 picks an ephemeral port, see [`port`](Self::port).
    ///
    /// # Errors
    ///
    /// `AddressParse`, `Bind` or `Listen` when the socket cannot be set up,
    /// `Canceled` after [`cancel`](Self::cancel). Starting a running
    /// publisher again is a no-op.
    pub fn start(&self, address: &str, port: u16) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(PubSubError::Canceled);
        }
        if self.is_running() {
            tracing::warn!("Publisher {}: Already running", self.inner.endpoint());
            return Ok(());
        }

        let listener = {
            let _guard = self.inner.handle.enter();
            bind_listener(address, port, self.inner.config.listen_backlog)
        }
        .map_err(|e| {
            tracing::error!("Publisher {}:{}: {}", address, port, e);
            e
        })?;

        *self.inner.local_endpoint.lock() = listener.local_addr().ok();
        self.inner.running.store(true, Ordering::Release);
        tracing::info!(
            "Publisher {}: Created publisher and waiting for subscribers.",
            self.inner.endpoint()
        );

        self.inner
            .handle
            .spawn(self.inner.clone().accept_loop(listener));
        Ok(())
    }

    /// Send one payload to every connected subscriber.
    ///
    /// A subscriber that is still busy with the previous message only gets
    /// the newest one once it catches up. With no subscribers connected this
    /// does nothing.
    ///
    /// # Errors
    ///
    /// `NotRunning` if the publisher was never started or has been canceled.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.send_parts(&[payload])
    }

    /// Send the concatenation of `parts` as one payload.
    pub fn send_parts(&self, parts: &[&[u8]]) -> Result<()> {
        if !self.is_running() {
            return Err(PubSubError::NotRunning);
        }

        let sessions = self.inner.sessions.lock().clone();
        if sessions.is_empty() {
            return Ok(());
        }

        let mut buffer = self.inner.pool.allocate();
        encode_frame_into(&mut buffer, MessageType::RegularPayload, parts);
        let buffer = buffer.share();

        for session in &sessions {
            session.send_data_buffer(buffer.clone());
        }
        Ok(())
    }

    /// Bound port, 0 if not started.
    pub fn port(&self) -> u16 {
        self.inner
            .local_endpoint
            .lock()
            .map(|endpoint| endpoint.port())
            .unwrap_or(0)
    }

    /// Bound address, if started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_endpoint.lock()
    }

    /// Number of connected subscribers, including ones still handshaking.
    pub fn subscriber_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Stop accepting and close every subscriber connection. Idempotent.
    pub fn cancel(&self) {
        let was_running = self.inner.running.swap(false, Ordering::AcqRel);
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        if was_running {
            tracing::info!("Publisher {}: Shutting down", self.inner.endpoint());
        }

        let sessions = self.inner.sessions.lock().clone();
        for session in sessions {
            session.cancel();
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("endpoint", &self.inner.endpoint())
            .field("running", &self.is_running())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
