//! Expiry timer service backing the offline message queue's Message Expiry
//! Interval handling.
//!
//! Each call to [`TimerService::schedule`] spawns a task that sleeps until a
//! deadline and then invokes a caller-supplied callback with a [`FireOutcome`]
//! distinguishing a real fire from a cancellation. The returned
//! [`ExpiryTimerHandle`] is the sole owner of the timer: dropping it cancels
//! the pending sleep. Per the design notes, the callback does not hold the
//! handle itself (that would recreate the cyclic ownership the original
//! shared-timer design has); instead it closes over a `TimerId` plus whatever
//! weak reference it needs to look the entry back up, and is a defensive
//! no-op if that lookup comes up empty.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

/// Opaque identity for a scheduled timer. Two `ExpiryTimerHandle`s refer to
/// the same pending deadline iff their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Whether a timer's sleep elapsed naturally or was cut short by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Fired,
    Cancelled,
}

/// Shared factory for scheduling expiry timers.
///
/// Cheap to clone; every clone schedules onto the same executor and hands out
/// ids from the same counter. Many offline queues may share one
/// `TimerService`; each registration only touches the queue that created it.
#[derive(Clone, Default)]
pub struct TimerService {
    next_id: Arc<AtomicU64>,
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Schedule `on_fire` to run after `duration`, unless the returned handle
    /// is dropped first.
    ///
    /// `on_fire` runs on whatever task polls the sleep to completion; it must
    /// not block or await anything slow.
    pub fn schedule<F>(&self, duration: Duration, on_fire: F) -> ExpiryTimerHandle
    where
        F: FnOnce(TimerId, FireOutcome) + Send + 'static,
    {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + duration;
        let (cancel_tx, cancel_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = cancel_rx => {
                    on_fire(id, FireOutcome::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    on_fire(id, FireOutcome::Fired);
                }
            }
        });

        ExpiryTimerHandle {
            id,
            deadline,
            cancel_tx: Some(cancel_tx),
        }
    }
}

/// A pending expiry deadline. Co-owned by nothing else: dropping the handle
/// cancels the timer.
pub struct ExpiryTimerHandle {
    id: TimerId,
    deadline: Instant,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl ExpiryTimerHandle {
    /// Seconds remaining until the deadline; `0` once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn id(&self) -> TimerId {
        self.id
    }
}

impl std::fmt::Debug for ExpiryTimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryTimerHandle")
            .field("id", &self.id)
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl PartialEq for ExpiryTimerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ExpiryTimerHandle {}

impl Drop for ExpiryTimerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            // Receiver may already be gone if the timer fired first; that's
            // a no-op, not an error.
            let _ = tx.send(());
        }
    }
}
