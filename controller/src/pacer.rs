use std::sync::{Mutex, PoisonError};
use tokio::time::{Duration, Instant};

/// The default minimum time between scheduled drains.
pub const DEFAULT_DRAIN_BUFFER: Duration = Duration::from_secs(10 * 60);

/// Spaces out drains across the whole cluster.
///
/// The pacer holds the instant after which the next drain may run. Every reservation pushes that instant at least
/// `buffer` past both the previous reservation and the current time, so a burst of cordoned nodes is drained one
/// `buffer` apart rather than all at once.
#[derive(Debug)]
pub struct DrainPacer {
    buffer: Duration,
    last_drain_scheduled_for: Mutex<Instant>,
}

impl DrainPacer {
    pub fn new(buffer: Duration) -> Self {
        Self::starting_at(buffer, Instant::now())
    }

    pub fn starting_at(buffer: Duration, start: Instant) -> Self {
        DrainPacer {
            buffer,
            last_drain_scheduled_for: Mutex::new(start),
        }
    }

    /// The instant reserved by the most recent reservation or reset.
    pub fn last_drain_scheduled_for(&self) -> Instant {
        *self.lock()
    }

    /// Reserves the next drain slot, returning the instant at which the drain may begin.
    pub fn reserve_next_slot(&self) -> Instant {
        self.reserve_next_slot_at(Instant::now())
    }

    /// Reserves the next drain slot as of `now`.
    ///
    /// The read of the previous reservation and the write of the new one happen under a single lock, so concurrent
    /// reservations always receive distinct slots at least `buffer` apart.
    pub fn reserve_next_slot_at(&self, now: Instant) -> Instant {
        let mut last_drain_scheduled_for = self.lock();
        let slot = (*last_drain_scheduled_for).max(now) + self.buffer;
        *last_drain_scheduled_for = slot;
        slot
    }

    /// Resets the pacing clock to the current time. Called when a scheduled drain begins.
    pub fn reset(&self) {
        self.reset_at(Instant::now())
    }

    pub fn reset_at(&self, now: Instant) {
        *self.lock() = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last_drain_scheduled_for
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
