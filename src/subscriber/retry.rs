//! Reconnection budget of one subscriber session.

/// Remaining reconnection attempts.
///
/// - negative: retry forever
/// - zero: give up on the next failure
/// - positive: that many more attempts
///
/// The budget is restored whenever the publisher delivers a frame, so it
/// limits consecutive failures rather than failures over the session's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max: i32,
    remaining: i32,
}

impl RetryBudget {
    pub fn new(max: i32) -> Self {
        Self {
            max,
            remaining: max,
        }
    }

    /// Budget that never runs out.
    pub fn unlimited() -> Self {
        Self::new(-1)
    }

    /// Spend one attempt after a failure.
    ///
    /// Returns `false` when the budget is exhausted and the session must stop.
    pub fn try_consume(&mut self) -> bool {
        if self.remaining < 0 {
            return true;
        }
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Restore the configured maximum.
    pub fn reset(&mut self) {
        self.remaining = self.max;
    }

    /// Attempts left, negative for unlimited.
    pub fn remaining(&self) -> i32 {
        self.remaining
    }

    pub fn is_unlimited(&self) -> bool {
        self.max < 0
    }
}
