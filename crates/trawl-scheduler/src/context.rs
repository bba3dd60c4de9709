use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use trawl_core::Error;

use crate::CancellationToken;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Per-query context passed through the routing and dispatch layers.
///
/// Cheap to clone. Cancellation is cooperative via [`CancellationToken`]. The deadline never fires
/// the token; callers bound their work with [`RequestContext::remaining`] so that running out of
/// time reads as a timeout, not a cancellation.
#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: u64,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(cancel: CancellationToken, deadline: Option<Instant>) -> Self {
        Self {
            request_id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            cancel,
            deadline,
        }
    }

    /// A fresh context with its own cancellation scope and no deadline.
    pub fn background() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns the remaining time budget until the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        Some(self.deadline?.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Clone the context, but replace the cancellation token with a child token.
    ///
    /// Cancelling the child never cancels the parent.
    pub fn child(&self) -> Self {
        Self {
            request_id: self.request_id,
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    /// The same request and deadline, cancelled through `cancel` instead.
    pub fn with_token(&self, cancel: CancellationToken) -> Self {
        Self {
            request_id: self.request_id,
            cancel,
            deadline: self.deadline,
        }
    }

    /// Fails with `Cancelled` once the token fired, or `Timeout` once the deadline passed.
    pub fn check(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        match self.remaining() {
            Some(remaining) if remaining.is_zero() => {
                Err(Error::timeout("query deadline exceeded"))
            }
            _ => Ok(()),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}
