//! Single-flight drain bookkeeping.
//!
//! A [`DrainFlag`] admits one drain at a time. A second caller that tries to
//! start while one is running gets `None` back instead of blocking, and the
//! flag is released when the returned guard drops, including on early return
//! or panic inside the drain.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters for observability of the drain loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Drains started since the flag was created
    pub drains_started: u64,
    /// Triggers that found a drain already running
    pub drains_skipped: u64,
    /// Queue items settled (applied, resolved or rejected) across all drains
    pub items_settled: u64,
    /// Whether a drain is running right now
    pub draining: bool,
}

#[derive(Debug, Default)]
pub struct DrainFlag {
    draining: AtomicBool,
    started: AtomicU64,
    skipped: AtomicU64,
    settled: AtomicU64,
}

impl DrainFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag, or `None` if a drain is already in progress.
    pub fn try_begin(&self) -> Option<DrainGuard<'_>> {
        if self.draining.swap(true, Ordering::AcqRel) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.started.fetch_add(1, Ordering::Relaxed);
        Some(DrainGuard(&self.draining))
    }

    pub fn record_settled(&self, count: u64) {
        self.settled.fetch_add(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> DrainStats {
        DrainStats {
            drains_started: self.started.load(Ordering::Relaxed),
            drains_skipped: self.skipped.load(Ordering::Relaxed),
            items_settled: self.settled.load(Ordering::Relaxed),
            draining: self.is_draining(),
        }
    }
}

/// RAII guard to reset the draining flag.
pub struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_begin_is_rejected_until_guard_drops() {
        let flag = DrainFlag::new();

        let guard = flag.try_begin();
        assert!(guard.is_some());
        assert!(flag.is_draining());
        assert!(flag.try_begin().is_none());

        drop(guard);
        assert!(!flag.is_draining());
        assert!(flag.try_begin().is_some());

        let stats = flag.stats();
        assert_eq!(stats.drains_started, 2);
        assert_eq!(stats.drains_skipped, 1);
    }

    #[test]
    fn test_guard_released_on_panic() {
        let flag = DrainFlag::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = flag.try_begin();
            panic!("boom");
        }));

        assert!(result.is_err());
        assert!(!flag.is_draining());
    }

    #[test]
    fn test_settled_counter() {
        let flag = DrainFlag::new();
        flag.record_settled(3);
        flag.record_settled(2);
        assert_eq!(flag.stats().items_settled, 5);
    }
}
