//! Delivery of received payloads to the user callback.
//!
//! Two modes:
//!
//! - **Synchronous**: the callback runs inline on the session task that
//!   received the frame. A slow callback stalls that connection.
//! - **Asynchronous**: payloads go into a [`Mailbox`] and a dedicated
//!   delivery thread invokes the callback. Only the newest undelivered
//!   payload is kept; older ones are dropped.
//!
//! The default is a synchronous no-op.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::RwLock;

use crate::buffer_pool::SharedBuffer;
use crate::mailbox::Mailbox;

/// Name of the asynchronous delivery thread.
pub const DELIVERY_THREAD_NAME: &str = "tcp-pubsub-delivery";

/// User callback invoked for every delivered payload.
pub type Callback = Arc<dyn Fn(&CallbackData) + Send + Sync>;

/// What the user callback receives.
#[derive(Clone)]
pub struct CallbackData {
    /// Pooled payload buffer; returns to the pool once all clones drop.
    pub buffer: SharedBuffer,
}

impl CallbackData {
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buffer
    }
}

impl fmt::Debug for CallbackData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackData")
            .field("len", &self.buffer.len())
            .finish()
    }
}

/// Thread draining a mailbox into the callback.
struct DeliveryThread {
    mailbox: Arc<Mailbox<SharedBuffer>>,
    thread: Option<JoinHandle<()>>,
}

impl DeliveryThread {
    fn spawn(callback: Callback) -> io::Result<Self> {
        let mailbox = Arc::new(Mailbox::new());
        let receiver = mailbox.clone();
        let thread = thread::Builder::new()
            .name(DELIVERY_THREAD_NAME.to_string())
            .spawn(move || {
                while let Some(buffer) = receiver.wait_take() {
                    callback(&CallbackData { buffer });
                }
                tracing::trace!("Callback delivery thread stopped");
            })?;

        Ok(Self {
            mailbox,
            thread: Some(thread),
        })
    }

    /// Close the mailbox and wait for the thread.
    ///
    /// Called from the delivery thread itself (a callback replacing or
    /// clearing the callback), the thread is detached instead.
    fn stop(mut self) {
        self.mailbox.close();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("Callback delivery thread panicked");
            }
        }
    }
}

enum Mode {
    Synchronous(Callback),
    Asynchronous(DeliveryThread),
}

impl Mode {
    fn stop(self) {
        if let Mode::Asynchronous(delivery) = self {
            delivery.stop();
        }
    }
}

/// Routes payloads from all sessions of a subscriber to its callback.
pub struct Dispatcher {
    mode: RwLock<Mode>,
}

impl Dispatcher {
    /// Dispatcher with the default no-op synchronous callback.
    pub fn new() -> Self {
        Self {
            mode: RwLock::new(Mode::Synchronous(no_op())),
        }
    }

    /// Install a callback, replacing (and stopping) the previous one.
    ///
    /// # Errors
    ///
    /// Fails only if the asynchronous delivery thread cannot be spawned; the
    /// previous callback then stays installed.
    pub fn set_callback(&self, callback: Callback, synchronous: bool) -> io::Result<()> {
        let next = if synchronous {
            Mode::Synchronous(callback)
        } else {
            Mode::Asynchronous(DeliveryThread::spawn(callback)?)
        };
        self.install(next);
        Ok(())
    }

    /// Go back to the no-op synchronous callback.
    pub fn clear_callback(&self) {
        self.install(Mode::Synchronous(no_op()));
    }

    fn install(&self, next: Mode) {
        let previous = std::mem::replace(&mut *self.mode.write(), next);
        // Stopped outside the lock: joining may wait for a callback that
        // itself calls into the subscriber.
        previous.stop();
    }

    /// Hand a received payload to the current callback.
    pub fn deliver(&self, buffer: SharedBuffer) {
        enum Target {
            Inline(Callback),
            Queue(Arc<Mailbox<SharedBuffer>>),
        }

        let target = match &*self.mode.read() {
            Mode::Synchronous(callback) => Target::Inline(callback.clone()),
            Mode::Asynchronous(delivery) => Target::Queue(delivery.mailbox.clone()),
        };

        match target {
            Target::Inline(callback) => callback(&CallbackData { buffer }),
            Target::Queue(mailbox) => {
                if mailbox.replace(buffer).is_some() {
                    tracing::trace!("Dropped undelivered payload in favor of a newer one");
                }
            }
        }
    }

    #[cfg(test)]
    pub fn is_synchronous(&self) -> bool {
        matches!(&*self.mode.read(), Mode::Synchronous(_))
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.clear_callback();
    }
}

fn no_op() -> Callback {
    Arc::new(|_: &CallbackData| {})
}
