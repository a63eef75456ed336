//! Lock-hold watchdog for the shared-state mutexes.
//!
//! Every guard on the store or linemap mutex should be short-lived; long
//! holds are exactly the stutter this design exists to avoid, so they are
//! logged rather than silently tolerated.

use parking_lot::{Mutex, MutexGuard};
use std::{
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};
use tracing::warn;

const HOLD_WARN: Duration = Duration::from_millis(5);

/// A [`MutexGuard`] that warns if it was held longer than a few milliseconds.
pub struct WatchedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    label: &'static str,
    since: Instant,
}

/// Lock `mutex`, tracking hold time under `label`.
pub fn watched<'a, T>(mutex: &'a Mutex<T>, label: &'static str) -> WatchedGuard<'a, T> {
    WatchedGuard {
        guard: mutex.lock(),
        label,
        since: Instant::now(),
    }
}

impl<T> WatchedGuard<'_, T> {
    /// Briefly release the lock so a contending thread can make progress,
    /// then re-acquire it.
    pub fn bump(&mut self) {
        self.check();
        MutexGuard::bump(&mut self.guard);
        self.since = Instant::now();
    }

    fn check(&self) {
        let held = self.since.elapsed();
        if held > HOLD_WARN {
            warn!(
                lock = self.label,
                held_ms = held.as_secs_f64() * 1000.0,
                "shared state held too long"
            );
        }
    }
}

impl<T> Deref for WatchedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for WatchedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for WatchedGuard<'_, T> {
    fn drop(&mut self) {
        self.check();
    }
}
