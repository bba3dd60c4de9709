use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use trawl_core::Error;

use crate::CancellationToken;

#[derive(Debug)]
struct LimiterState {
    limit: usize,
    in_flight: usize,
}

#[derive(Debug)]
struct LimiterInner {
    state: Mutex<LimiterState>,
    notify: Notify,
}

/// A counting limiter whose capacity can change while permits are held.
///
/// Shrinking the limit never revokes permits that are already held: the number of holders may
/// exceed the new limit until enough of them are released. Waiters are admitted in no particular
/// order.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

impl ConcurrencyLimiter {
    /// A limit of zero is treated as one so acquirers always make progress.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                state: Mutex::new(LimiterState {
                    limit: limit.max(1),
                    in_flight: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.state.lock().limit
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    pub fn set_limit(&self, limit: usize) {
        let limit = limit.max(1);
        let grew = {
            let mut state = self.inner.state.lock();
            let grew = limit > state.limit;
            state.limit = limit;
            grew
        };
        if grew {
            self.inner.notify.notify_waiters();
        }
        tracing::debug!(target: "trawl.limiter", limit, "resized concurrency limiter");
    }

    /// Waits for a free slot.
    ///
    /// Fails with `Cancelled` if `cancel` fires first. The returned permit carries a child of
    /// `cancel` so work done under the permit can be cancelled independently.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<LimiterPermit, Error> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the await is not lost.
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(Error::cancelled());
            }
            if let Some(permit) = self.try_acquire_with(cancel) {
                return Ok(permit);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::cancelled()),
                _ = &mut notified => {}
            }
        }
    }

    pub fn try_acquire(&self) -> Option<LimiterPermit> {
        self.try_acquire_with(&CancellationToken::new())
    }

    fn try_acquire_with(&self, cancel: &CancellationToken) -> Option<LimiterPermit> {
        let mut state = self.inner.state.lock();
        if state.in_flight >= state.limit {
            return None;
        }
        state.in_flight += 1;
        Some(LimiterPermit {
            inner: Arc::clone(&self.inner),
            token: cancel.child_token(),
        })
    }
}

/// A held slot of a [`ConcurrencyLimiter`]; released on drop.
#[derive(Debug)]
pub struct LimiterPermit {
    inner: Arc<LimiterInner>,
    token: CancellationToken,
}

impl LimiterPermit {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        let wake = {
            let mut state = self.inner.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.in_flight < state.limit
        };
        if wake {
            self.inner.notify.notify_one();
        }
    }
}
