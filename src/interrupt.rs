//! Cooperative cancellation for blocking deliveries.
//!
//! Preemption must reach the consumer thread even while it is blocked inside
//! a sink call, so instead of a raw thread-interrupt primitive the pipeline
//! hands every delivery an explicit [`InterruptFlag`]. Sinks treat
//! interruption as always possible: any blocking operation they perform
//! should go through [`InterruptFlag::wait_interruptible`] or poll
//! [`InterruptFlag::is_raised`] between steps.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A raisable, waitable cancellation token shared between the thread that
/// requests preemption and the thread performing a blocking delivery.
#[derive(Debug, Default)]
pub struct InterruptFlag {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every thread blocked in
    /// [`wait_interruptible`](Self::wait_interruptible).
    pub fn raise(&self) {
        let mut raised = self.raised.lock().unwrap();
        *raised = true;
        self.cond.notify_all();
    }

    /// Whether the flag is currently raised.
    pub fn is_raised(&self) -> bool {
        *self.raised.lock().unwrap()
    }

    /// Lower the flag, returning whether it had been raised.
    pub fn clear(&self) -> bool {
        let mut raised = self.raised.lock().unwrap();
        std::mem::replace(&mut *raised, false)
    }

    /// Block for up to `timeout` unless the flag is (or becomes) raised.
    ///
    /// Returns `true` if the wait was cut short by the flag.
    pub fn wait_interruptible(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut raised = self.raised.lock().unwrap();
        loop {
            if *raised {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(raised, deadline - now).unwrap();
            raised = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_flag_starts_lowered() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_raised());
        assert!(!flag.wait_interruptible(Duration::from_millis(1)));
    }

    #[test]
    fn test_raise_and_clear() {
        let flag = InterruptFlag::new();
        flag.raise();
        assert!(flag.is_raised());
        assert!(flag.clear());
        assert!(!flag.is_raised());
        assert!(!flag.clear());
    }

    #[test]
    fn test_raised_flag_skips_wait() {
        let flag = InterruptFlag::new();
        flag.raise();
        let start = Instant::now();
        assert!(flag.wait_interruptible(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_raise_wakes_blocked_waiter() {
        let flag = Arc::new(InterruptFlag::new());
        let waiter = {
            let flag = flag.clone();
            std::thread::spawn(move || flag.wait_interruptible(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(50));
        flag.raise();
        assert!(waiter.join().unwrap());
    }
}
