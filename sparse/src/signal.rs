//! Lock-free-ish change notification via a monotonic epoch counter.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Monotonic version counter with a condition variable attached.
///
/// The interactive thread only ever polls [`current`](Self::current);
/// background collaborators (the renderer's refresh loop, tests) may block in
/// [`wait_past`](Self::wait_past).
pub struct ChangeSignal {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl Default for ChangeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSignal {
    pub fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn current(&self) -> u64 {
        *self.epoch.lock()
    }

    pub fn bump(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.cond.notify_all();
    }

    /// Block until the epoch exceeds `seen` or the timeout expires; returns
    /// the epoch observed on wakeup. Never called from the interactive thread.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = std::time::Instant::now() + timeout;
        let mut epoch = self.epoch.lock();
        while *epoch <= seen {
            if self.cond.wait_until(&mut epoch, deadline).timed_out() {
                break;
            }
        }
        *epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[test]
    fn bump_wakes_waiter() {
        let signal = Arc::new(ChangeSignal::new());
        let seen = signal.current();
        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.wait_past(seen, Duration::from_secs(5)))
        };
        signal.bump();
        assert!(waiter.join().unwrap() > seen);
    }

    #[test]
    fn wait_times_out() {
        let signal = ChangeSignal::new();
        let seen = signal.current();
        assert_eq!(signal.wait_past(seen, Duration::from_millis(10)), seen);
    }
}
