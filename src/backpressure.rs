//! Backpressure handling for publisher session writes.
//!
//! A publisher never queues more than one message per subscriber. Each
//! session owns an [`Outbox`] with two places:
//!
//! - the in-flight write (at most one at a time), tracked by a flag
//! - a single pending slot for the next message
//!
//! Submitting while a write is in flight parks the item in the pending slot,
//! replacing (dropping) whatever was parked before. A slow subscriber
//! therefore always receives the most recent message once it catches up,
//! while intermediate ones are skipped.
//!
//! ```text
//! send(W1) ─► in flight: W1   pending: -
//! send(W2) ─► in flight: W1   pending: W2
//! send(W3) ─► in flight: W1   pending: W3   (W2 dropped)
//! W1 done  ─► in flight: W3   pending: -
//! ```
//!
//! The outbox only decides; the caller performs the actual I/O.

use parking_lot::Mutex;

/// Outcome of [`Outbox::submit`].
#[derive(Debug, PartialEq, Eq)]
pub enum Submit<T> {
    /// Nothing was in flight: the caller must write this item now.
    WriteNow(T),
    /// A write is in flight (or the session is not running yet); the item
    /// waits in the pending slot. `displaced` is the item it replaced.
    Parked { displaced: Option<T> },
}

#[derive(Debug)]
struct OutboxState<T> {
    in_flight: bool,
    pending: Option<T>,
    dropped: u64,
}

/// Single-slot, latest-wins send queue.
#[derive(Debug)]
pub struct Outbox<T> {
    state: Mutex<OutboxState<T>>,
}

impl<T> Outbox<T> {
    /// Create an idle outbox.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OutboxState {
                in_flight: false,
                pending: None,
                dropped: 0,
            }),
        }
    }

    /// Offer a user message.
    ///
    /// When `running` is false the item is only parked, so a session that is
    /// still handshaking delivers the latest message right after its
    /// handshake response.
    pub fn submit(&self, item: T, running: bool) -> Submit<T> {
        let mut state = self.state.lock();
        if running && !state.in_flight {
            state.in_flight = true;
            return Submit::WriteNow(item);
        }

        let displaced = state.pending.replace(item);
        if displaced.is_some() {
            state.dropped += 1;
        }
        Submit::Parked { displaced }
    }

    /// Start a control write (the handshake response) ahead of any pending
    /// user message.
    ///
    /// Returns the item back if it can be written now. If another write is
    /// already in flight the control item takes the pending slot and `None`
    /// is returned.
    pub fn begin_control(&self, item: T) -> Option<T> {
        let mut state = self.state.lock();
        if state.in_flight {
            if state.pending.replace(item).is_some() {
                state.dropped += 1;
            }
            return None;
        }
        state.in_flight = true;
        Some(item)
    }

    /// Mark the in-flight write as finished.
    ///
    /// Returns the pending item, which becomes the new in-flight write, or
    /// `None` if the outbox is now idle.
    pub fn complete(&self) -> Option<T> {
        let mut state = self.state.lock();
        match state.pending.take() {
            Some(next) => Some(next),
            None => {
                state.in_flight = false;
                None
            }
        }
    }

    /// Drop the pending item and forget about any in-flight write.
    pub fn clear(&self) -> Option<T> {
        let mut state = self.state.lock();
        state.in_flight = false;
        state.pending.take()
    }

    /// Whether a write is currently in flight.
    #[cfg(test)]
    pub fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Whether an item waits in the pending slot.
    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Number of items replaced before they could be written.
    #[inline]
    pub fn dropped_count(&self) -> u64 {
        self.state.lock().dropped
    }
}

impl<T> Default for Outbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
