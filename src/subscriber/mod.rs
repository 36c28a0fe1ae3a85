//! Subscriber: keeps connections to publishers and delivers their payloads.
//!
//! One subscriber may connect to several publishers; all payloads go to the
//! single callback installed with [`Subscriber::set_callback`].
//!
//! # Example
//!
//! ```no_run
//! use tcp_pubsub::{CallbackData, Executor, Subscriber};
//!
//! let executor = Executor::new(4).unwrap();
//! let subscriber = Subscriber::new(&executor);
//! subscriber.add_session("localhost", 1588);
//!
//! subscriber
//!     .set_callback(
//!         |data: &CallbackData| println!("{}", String::from_utf8_lossy(data.payload())),
//!         false,
//!     )
//!     .unwrap();
//! ```

mod dispatcher;
mod retry;
mod session;

pub use dispatcher::{Callback, CallbackData, DELIVERY_THREAD_NAME};
pub use retry::RetryBudget;
pub use session::{SessionState, SubscriberSession};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::buffer_pool::BufferPool;
use crate::config::SubscriberConfig;
use crate::error::{PubSubError, Result};
use crate::executor::Executor;
use dispatcher::Dispatcher;

struct SubscriberInner {
    handle: Handle,
    config: SubscriberConfig,
    pool: BufferPool,
    dispatcher: Arc<Dispatcher>,
    sessions: Mutex<Vec<SubscriberSession>>,
    canceled: AtomicBool,
}

impl SubscriberInner {
    fn remove_session(&self, closed: &SubscriberSession) {
        let count = {
            let mut sessions = self.sessions.lock();
            sessions.retain(|session| session != closed);
            sessions.len()
        };
        tracing::debug!(
            "Subscriber: Session to {}:{} closed. Remaining sessions: {}",
            closed.address(),
            closed.port(),
            count
        );
    }
}

/// A set of outbound connections sharing one callback.
///
/// Dropping the subscriber cancels every session and stops callback delivery.
pub struct Subscriber {
    // Keeps the worker pool alive for as long as the subscriber exists.
    _executor: Executor,
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    pub fn new(executor: &Executor) -> Self {
        Self::with_config(executor, SubscriberConfig::default())
    }

    pub fn with_config(executor: &Executor, config: SubscriberConfig) -> Self {
        Self {
            _executor: executor.clone(),
            inner: Arc::new(SubscriberInner {
                handle: executor.handle().clone(),
                config,
                pool: BufferPool::new(),
                dispatcher: Arc::new(Dispatcher::new()),
                sessions: Mutex::new(Vec::new()),
                canceled: AtomicBool::new(false),
            }),
        }
    }

    /// Connect to a publisher, retrying per the configured default budget.
    pub fn add_session(&self, address: &str, port: u16) -> SubscriberSession {
        let attempts = self.inner.config.default_max_reconnection_attempts;
        self.add_session_with_attempts(address, port, attempts)
    }

    /// Connect to a publisher with an explicit reconnection budget.
    ///
    /// `-1` retries forever, `0` gives up after the first failure. The
    /// budget is restored every time the publisher delivers a frame.
    pub fn add_session_with_attempts(
        &self,
        address: &str,
        port: u16,
        max_reconnection_attempts: i32,
    ) -> SubscriberSession {
        let owner: Weak<SubscriberInner> = Arc::downgrade(&self.inner);
        let session = SubscriberSession::new(
            address,
            port,
            max_reconnection_attempts,
            self.inner.config.clone(),
            self.inner.pool.clone(),
            self.inner.dispatcher.clone(),
            Box::new(move |closed| {
                if let Some(owner) = owner.upgrade() {
                    owner.remove_session(closed);
                }
            }),
        );

        // Listed before it starts, so an immediate close finds itself.
        self.inner.sessions.lock().push(session.clone());
        tracing::debug!("Subscriber: Added session to {}:{}", address, port);

        if self.inner.canceled.load(Ordering::Acquire) {
            session.cancel();
        }
        session.start(&self.inner.handle);
        session
    }

    /// Snapshot of the sessions that have not closed yet.
    pub fn sessions(&self) -> Vec<SubscriberSession> {
        self.inner.sessions.lock().clone()
    }

    /// Install the callback for all received payloads.
    ///
    /// With `synchronous` the callback runs on the network task that
    /// received the payload. Otherwise a dedicated thread runs it and, while
    /// it is busy, only the newest payload is kept.
    ///
    /// # Errors
    ///
    /// `Runtime` if the delivery thread cannot be spawned.
    pub fn set_callback<F>(&self, callback: F, synchronous: bool) -> Result<()>
    where
        F: Fn(&CallbackData) + Send + Sync + 'static,
    {
        self.inner
            .dispatcher
            .set_callback(Arc::new(callback), synchronous)
            .map_err(PubSubError::Runtime)
    }

    /// Replace the callback with a no-op.
    pub fn clear_callback(&self) {
        self.inner.dispatcher.clear_callback();
    }

    /// Cancel every session and stop callback delivery. Idempotent.
    ///
    /// The asynchronous delivery thread, if any, is stopped and the callback
    /// reset to a no-op; a payload still waiting for delivery is dropped.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions = self.sessions();
        for session in sessions {
            session.cancel();
        }
        self.inner.dispatcher.clear_callback();
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel();
        self.inner.dispatcher.clear_callback();
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("sessions", &self.sessions())
            .finish()
    }
}
