//! Resize coalescing.
//!
//! Holds only the latest requested size and a deadline. Every new request
//! replaces the pending size and pushes the deadline out by the full window,
//! so a burst of resizes results in a single pty resize once it settles.

use std::time::Duration;

use protocol::Dimensions;
use tokio::time::Instant;

/// Collapses a stream of resize requests into the last one.
#[derive(Debug)]
pub struct ResizeDebouncer {
    window: Duration,
    pending: Option<Dimensions>,
    deadline: Option<Instant>,
}

impl ResizeDebouncer {
    /// Creates a debouncer with the given quiet period.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
        }
    }

    /// Records a request and re-arms the deadline.
    pub fn push(&mut self, dims: Dimensions, now: Instant) {
        self.pending = Some(dims);
        self.deadline = Some(now + self.window);
    }

    /// When the pending size should be applied, if one is waiting.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Takes the pending size if its deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<Dimensions> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.pending.take()
            }
            _ => None,
        }
    }
}
