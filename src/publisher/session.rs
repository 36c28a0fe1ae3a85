//! One accepted subscriber connection on the publisher side.
//!
//! # Lifecycle
//!
//! ```text
//! NotStarted ──start()──► Handshaking ──handshake──► Running
//!      │                       │                        │
//!      └───────────────────────┴──── error / cancel ────┴──► Canceled
//! ```
//!
//! Reads run on a dedicated reader task; writes run on the session's
//! [`SerialContext`], one at a time, driven by the [`Outbox`].

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::backpressure::{Outbox, Submit};
use crate::buffer_pool::{BufferPool, SharedBuffer};
use crate::config::PublisherConfig;
use crate::error::{PubSubError, Result};
use crate::executor::SerialContext;
use crate::protocol::{
    encode_frame_into, Frame, FrameDecoder, HandshakeMessage, MessageType,
};
use crate::transport::{describe_connection, set_nodelay};

/// Publisher session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Handshaking,
    Running,
    Canceled,
}

impl SessionState {
    /// Check if a transition is valid.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (NotStarted, Handshaking) | (Handshaking, Running) | (NotStarted, Canceled)
                | (Handshaking, Canceled)
                | (Running, Canceled)
        )
    }
}

/// Called exactly once when the session has been canceled.
pub(crate) type ClosedHandler = Box<dyn FnOnce(&Arc<PublisherSession>) + Send>;

/// Server side of one subscriber connection.
pub struct PublisherSession {
    me: Weak<PublisherSession>,
    /// `local->remote`, for log messages.
    description: String,
    state: Mutex<SessionState>,
    /// Taken by the reader task on start.
    reader: Mutex<Option<OwnedReadHalf>>,
    /// `None` once the socket has been closed.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    writes: SerialContext,
    outbox: Outbox<SharedBuffer>,
    cancel: CancellationToken,
    pool: BufferPool,
    config: PublisherConfig,
    handle: Handle,
    on_closed: Mutex<Option<ClosedHandler>>,
}

impl PublisherSession {
    /// Wrap an accepted connection. Nagle's algorithm is disabled here.
    pub(crate) fn new(
        stream: TcpStream,
        handle: Handle,
        pool: BufferPool,
        config: PublisherConfig,
        on_closed: ClosedHandler,
    ) -> Arc<Self> {
        let description = describe_connection(&stream);
        set_nodelay(&stream, &format!("PublisherSession {}", description));
        let (reader, writer) = stream.into_split();
        let writes = SerialContext::new(&handle, format!("publisher-session {}", description));

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            description,
            state: Mutex::new(SessionState::NotStarted),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            writes,
            outbox: Outbox::new(),
            cancel: CancellationToken::new(),
            pool,
            config,
            handle,
            on_closed: Mutex::new(Some(on_closed)),
        })
    }

    /// Enter `Handshaking` and start reading.
    pub(crate) fn start(self: &Arc<Self>) {
        if let Err(e) = self.advance(SessionState::Handshaking) {
            tracing::warn!("PublisherSession {}: {}", self.description, e);
            return;
        }
        let Some(reader) = self.reader.lock().take() else {
            return;
        };

        let session = self.clone();
        self.handle.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => Err(PubSubError::Canceled),
                result = session.read_loop(reader) => result,
            };

            match result {
                Ok(()) | Err(PubSubError::Canceled) => {}
                Err(PubSubError::ConnectionClosed) => {
                    tracing::info!(
                        "PublisherSession {}: Connection closed by subscriber",
                        session.description
                    );
                }
                Err(e) => {
                    tracing::error!("PublisherSession {}: {}", session.description, e);
                }
            }
            session.cancel();
        });
    }

    /// Read and handle frames until the connection breaks.
    async fn read_loop(&self, mut reader: OwnedReadHalf) -> Result<()> {
        let mut decoder =
            FrameDecoder::with_max_payload(self.pool.clone(), self.config.max_payload_size);
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => return Err(PubSubError::ConnectionClosed),
                Ok(n) => n,
                Err(e) => return Err(PubSubError::Read(e)),
            };

            for frame in decoder.push(&buf[..n])? {
                self.handle_frame(frame)?;
            }
        }
    }

    fn handle_frame(&self, frame: Frame) -> Result<()> {
        if !frame.is_handshake() {
            return Err(PubSubError::Protocol(format!(
                "Received message of type {} from subscriber, only handshakes are accepted",
                frame.header.message_type
            )));
        }

        if self.state() == SessionState::Running {
            tracing::debug!(
                "PublisherSession {}: Ignoring repeated handshake",
                self.description
            );
            return Ok(());
        }

        if frame.payload().is_empty() {
            return Err(PubSubError::Protocol(
                "Received empty handshake request".to_string(),
            ));
        }
        let request = HandshakeMessage::decode(frame.payload());
        tracing::debug!(
            "PublisherSession {}: Received handshake request, protocol version {}",
            self.description,
            request.protocol_version
        );

        self.send_handshake_response()
    }

    /// Go `Running` and write the response ahead of any parked message.
    fn send_handshake_response(&self) -> Result<()> {
        let mut response = self.pool.allocate();
        encode_frame_into(
            &mut response,
            MessageType::ProtocolHandshake,
            &[&HandshakeMessage::current().encode()],
        );
        let response = response.share();

        let to_write = {
            // Same lock order as `send_data_buffer`: state, then outbox.
            let mut state = self.state.lock();
            if !state.can_transition_to(SessionState::Running) {
                return Err(PubSubError::Protocol(format!(
                    "Cannot handle handshake in state {:?}",
                    *state
                )));
            }
            let to_write = self.outbox.begin_control(response);
            *state = SessionState::Running;
            to_write
        };

        tracing::debug!(
            "PublisherSession {}: Sending handshake response",
            self.description
        );
        if let Some(buffer) = to_write {
            self.post_write(buffer);
        }
        Ok(())
    }

    /// Queue a frame for this subscriber, latest wins.
    pub(crate) fn send_data_buffer(&self, buffer: SharedBuffer) {
        let decision = {
            let state = self.state.lock();
            if *state == SessionState::Canceled {
                return;
            }
            self.outbox.submit(buffer, *state == SessionState::Running)
        };

        match decision {
            Submit::WriteNow(buffer) => self.post_write(buffer),
            Submit::Parked { displaced: Some(_) } => {
                tracing::trace!(
                    "PublisherSession {}: Replaced unsent buffer ({} dropped so far)",
                    self.description,
                    self.outbox.dropped_count()
                );
            }
            Submit::Parked { displaced: None } => {}
        }
    }

    fn post_write(&self, buffer: SharedBuffer) {
        let Some(session) = self.me.upgrade() else {
            return;
        };
        self.writes.post(async move { session.write_buffers(buffer).await });
    }

    /// Write `first`, then whatever the outbox hands over, until it is idle.
    async fn write_buffers(&self, first: SharedBuffer) {
        let mut next = Some(first);
        while let Some(buffer) = next.take() {
            let result = {
                let mut writer = self.writer.lock().await;
                match writer.as_mut() {
                    None => Err(PubSubError::Canceled),
                    Some(writer) => tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => Err(PubSubError::Canceled),
                        result = writer.write_all(&buffer) => result.map_err(PubSubError::Write),
                    },
                }
            };
            drop(buffer);

            if let Err(e) = result {
                if !e.is_canceled() {
                    tracing::error!(
                        "PublisherSession {}: Error sending data: {}",
                        self.description,
                        e
                    );
                }
                self.cancel();
                self.writer.lock().await.take();
                return;
            }
            next = self.outbox.complete();
        }
    }

    /// Close the connection and notify the owner. Idempotent.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Canceled {
                return;
            }
            *state = SessionState::Canceled;
        }
        tracing::debug!("PublisherSession {}: Canceling session", self.description);

        self.cancel.cancel();
        self.outbox.clear();
        // A write in progress holds the lock; it sees the token and closes.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        let handler = self.on_closed.lock().take();
        if let (Some(handler), Some(session)) = (handler, self.me.upgrade()) {
            handler(&session);
        }
    }

    /// Validated state change.
    fn advance(&self, next: SessionState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(PubSubError::Protocol(format!(
                "Invalid session state transition {:?} -> {:?}",
                *state, next
            )));
        }
        *state = next;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for PublisherSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherSession")
            .field("connection", &self.description)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::net::TcpListener;

    use crate::protocol::{build_frame, handshake_frame, Header, HEADER_SIZE};

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(NotStarted.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Running));
        assert!(Running.can_transition_to(Canceled));
        assert!(NotStarted.can_transition_to(Canceled));

        assert!(!NotStarted.can_transition_to(Running));
        assert!(!Running.can_transition_to(Handshaking));
        assert!(!Canceled.can_transition_to(Running));
        assert!(!Canceled.can_transition_to(Canceled));
    }

    /// Accepted session plus the raw client end of the connection.
    async fn connected_session(
        closed: Arc<AtomicUsize>,
    ) -> (Arc<PublisherSession>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let session = PublisherSession::new(
            server,
            Handle::current(),
            BufferPool::new(),
            PublisherConfig::default(),
            Box::new(move |_| {
                closed.fetch_add(1, Ordering::SeqCst);
            }),
        );
        session.start();
        (session, client)
    }

    async fn read_frame(client: &mut TcpStream) -> (Header, Vec<u8>) {
        let mut header = [0u8; HEADER_SIZE];
        client.read_exact(&mut header).await.unwrap();
        let header = Header::decode(&header).unwrap();
        let mut payload = vec![0u8; header.data_size as usize];
        client.read_exact(&mut payload).await.unwrap();
        (header, payload)
    }

    async fn wait_for_closed(closed: &AtomicUsize) {
        for _ in 0..500 {
            if closed.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    fn shared(pool: &BufferPool, payload: &[u8]) -> SharedBuffer {
        let mut buf = pool.allocate();
        encode_frame_into(&mut buf, MessageType::RegularPayload, &[payload]);
        buf.share()
    }

    #[tokio::test]
    async fn test_handshake_then_latest_parked_message() {
        let closed = Arc::new(AtomicUsize::new(0));
        let (session, mut client) = connected_session(closed.clone()).await;
        let pool = BufferPool::new();

        // Sent before the handshake: parked, older one replaced.
        session.send_data_buffer(shared(&pool, b"old"));
        session.send_data_buffer(shared(&pool, b"new"));
        assert_eq!(session.state(), SessionState::Handshaking);

        client.write_all(&handshake_frame()).await.unwrap();

        let (header, payload) = read_frame(&mut client).await;
        assert!(header.is_handshake());
        assert_eq!(payload, vec![0]);

        let (header, payload) = read_frame(&mut client).await;
        assert_eq!(header.kind(), Some(MessageType::RegularPayload));
        assert_eq!(payload, b"new");
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_writes_behind_stalled_write_coalesce() {
        let closed = Arc::new(AtomicUsize::new(0));
        let (session, mut client) = connected_session(closed.clone()).await;
        let pool = BufferPool::new();

        client.write_all(&handshake_frame()).await.unwrap();
        let (header, _) = read_frame(&mut client).await;
        assert!(header.is_handshake());
        assert!(wait_until_idle(&session).await);

        // Larger than the socket buffers, so W1 stays in flight while the
        // client is not reading.
        let w1 = vec![0xAB; 4 * 1024 * 1024];
        session.send_data_buffer(shared(&pool, &w1));
        assert!(session.outbox.is_in_flight());
        session.send_data_buffer(shared(&pool, b"w2"));
        session.send_data_buffer(shared(&pool, b"w3"));
        assert_eq!(session.outbox.dropped_count(), 1);

        let (_, payload) = read_frame(&mut client).await;
        assert_eq!(payload, w1);
        let (_, payload) = read_frame(&mut client).await;
        assert_eq!(payload, b"w3");

        let mut byte = [0u8; 1];
        let nothing_more =
            tokio::time::timeout(Duration::from_millis(100), client.read(&mut byte)).await;
        assert!(nothing_more.is_err());
        assert!(!session.outbox.is_in_flight());
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    /// Running with the handshake response fully written.
    async fn wait_until_idle(session: &PublisherSession) -> bool {
        for _ in 0..500 {
            if session.state() == SessionState::Running && !session.outbox.is_in_flight() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_non_handshake_frame_cancels() {
        let closed = Arc::new(AtomicUsize::new(0));
        let (session, mut client) = connected_session(closed.clone()).await;

        client
            .write_all(&build_frame(MessageType::RegularPayload, b"nope"))
            .await
            .unwrap();

        // The publisher closes the socket instead of answering.
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(session.state(), SessionState::Canceled);
        wait_for_closed(&closed).await;
    }

    #[tokio::test]
    async fn test_empty_handshake_is_violation() {
        let closed = Arc::new(AtomicUsize::new(0));
        let (session, mut client) = connected_session(closed.clone()).await;

        client
            .write_all(&build_frame(MessageType::ProtocolHandshake, b""))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(session.state(), SessionState::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_notifies_once() {
        let closed = Arc::new(AtomicUsize::new(0));
        let (session, _client) = connected_session(closed.clone()).await;

        session.cancel();
        session.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(session.state(), SessionState::Canceled);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_peer_disconnect_cancels() {
        let closed = Arc::new(AtomicUsize::new(0));
        let (session, client) = connected_session(closed.clone()).await;

        drop(client);

        wait_for_closed(&closed).await;
        assert_eq!(session.state(), SessionState::Canceled);
    }
}
