//! Single-slot handoff between a network task and a blocking consumer thread.
//!
//! Used by asynchronous callback delivery: the receive path stores the
//! newest payload, the delivery thread waits for one and takes it. Storing
//! while the slot is full replaces the old value, so a slow callback always
//! sees the latest message and never a backlog.

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

/// Latest-wins mailbox with a blocking receiver.
#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Store a value and wake the receiver.
    ///
    /// Returns the value that was replaced. After [`close`](Self::close) the
    /// value is dropped and `None` is returned.
    pub fn replace(&self, value: T) -> Option<T> {
        let mut slot = self.slot.lock();
        if slot.closed {
            return None;
        }
        let previous = slot.value.replace(value);
        drop(slot);
        self.ready.notify_one();
        previous
    }

    /// Take the current value without waiting.
    #[cfg(test)]
    pub fn take(&self) -> Option<T> {
        self.slot.lock().value.take()
    }

    /// Block until a value is available and take it.
    ///
    /// Returns `None` once the mailbox is closed.
    pub fn wait_take(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        loop {
            if slot.closed {
                return None;
            }
            if let Some(value) = slot.value.take() {
                return Some(value);
            }
            self.ready.wait(&mut slot);
        }
    }

    /// Close the mailbox, dropping any stored value and waking the receiver.
    pub fn close(&self) {
        let mut slot = self.slot.lock();
        slot.closed = true;
        slot.value = None;
        drop(slot);
        self.ready.notify_all();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
