//! Disk usage accounting.
//!
//! The datastore reports every change in stored payload bytes as a signed
//! delta to a [`UsageObserver`]: positive on `put`, negative on deletion and
//! `drop`. [`CompositeUsageObserver`] fans a delta out to several observers,
//! and [`QuotaTracker`] keeps the running total against a byte quota.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Receives signed changes in stored payload bytes.
///
/// Used as `Arc<dyn UsageObserver>`.
pub trait UsageObserver: Send + Sync {
    /// Called after stored content grew (`delta > 0`) or shrank (`delta < 0`).
    fn on_usage_change(&self, delta: i64);
}

/// Observer that ignores every delta.
pub struct NullUsageObserver;

impl UsageObserver for NullUsageObserver {
    fn on_usage_change(&self, _delta: i64) {}
}

/// Composite observer that fans out to multiple observers.
#[derive(Default)]
pub struct CompositeUsageObserver {
    observers: Vec<Arc<dyn UsageObserver>>,
}

impl CompositeUsageObserver {
    /// Creates a composite observer with the given list of observers.
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn UsageObserver>>) -> Self {
        Self { observers }
    }

    /// Adds an observer after construction.
    pub fn add(&mut self, observer: Arc<dyn UsageObserver>) {
        self.observers.push(observer);
    }
}

impl UsageObserver for CompositeUsageObserver {
    fn on_usage_change(&self, delta: i64) {
        for observer in &self.observers {
            observer.on_usage_change(delta);
        }
    }
}

/// Running byte total measured against a quota.
///
/// Also publishes the total as the `datastore_payload_bytes` gauge.
pub struct QuotaTracker {
    used: AtomicI64,
    quota: u64,
}

impl QuotaTracker {
    /// A tracker starting at `initial` bytes. A `quota` of 0 means unlimited.
    #[must_use]
    pub fn new(quota: u64, initial: u64) -> Self {
        let tracker = Self {
            used: AtomicI64::new(i64::try_from(initial).unwrap_or(i64::MAX)),
            quota,
        };
        tracker.publish();
        tracker
    }

    /// Bytes currently accounted for.
    #[must_use]
    pub fn used(&self) -> u64 {
        u64::try_from(self.used.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Configured quota in bytes; 0 means unlimited.
    #[must_use]
    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Bytes above the quota, 0 when within it or unlimited.
    #[must_use]
    pub fn excess(&self) -> u64 {
        if self.quota == 0 {
            return 0;
        }
        self.used().saturating_sub(self.quota)
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish(&self) {
        metrics::gauge!("datastore_payload_bytes").set(self.used() as f64);
    }
}

impl UsageObserver for QuotaTracker {
    fn on_usage_change(&self, delta: i64) {
        self.used.fetch_add(delta, Ordering::Relaxed);
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct CountingObserver {
        calls: AtomicUsize,
        total: AtomicI64,
    }

    impl CountingObserver {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                total: AtomicI64::new(0),
            }
        }
    }

    impl UsageObserver for CountingObserver {
        fn on_usage_change(&self, delta: i64) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.total.fetch_add(delta, Ordering::Relaxed);
        }
    }

    #[test]
    fn empty_composite_does_not_panic() {
        let composite = CompositeUsageObserver::default();
        composite.on_usage_change(10);
        composite.on_usage_change(-10);
    }

    #[test]
    fn composite_fans_out_to_every_observer() {
        let a = Arc::new(CountingObserver::new());
        let b = Arc::new(CountingObserver::new());
        let composite = CompositeUsageObserver::new(vec![
            Arc::clone(&a) as Arc<dyn UsageObserver>,
            Arc::clone(&b) as Arc<dyn UsageObserver>,
        ]);

        composite.on_usage_change(100);
        composite.on_usage_change(-40);

        for observer in [&a, &b] {
            assert_eq!(observer.calls.load(Ordering::Relaxed), 2);
            assert_eq!(observer.total.load(Ordering::Relaxed), 60);
        }
    }

    #[test]
    fn add_observer_after_construction() {
        let mut composite = CompositeUsageObserver::default();
        let observer = Arc::new(CountingObserver::new());

        composite.on_usage_change(5);
        composite.add(Arc::clone(&observer) as Arc<dyn UsageObserver>);
        composite.on_usage_change(7);

        assert_eq!(observer.total.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn quota_tracker_reports_excess() {
        let tracker = QuotaTracker::new(1_000, 400);
        assert_eq!(tracker.used(), 400);
        assert_eq!(tracker.excess(), 0);

        tracker.on_usage_change(900);
        assert_eq!(tracker.used(), 1_300);
        assert_eq!(tracker.excess(), 300);

        tracker.on_usage_change(-1_300);
        assert_eq!(tracker.used(), 0);
        assert_eq!(tracker.excess(), 0);
    }

    #[test]
    fn zero_quota_is_unlimited() {
        let tracker = QuotaTracker::new(0, 0);
        tracker.on_usage_change(i64::from(u32::MAX));
        assert_eq!(tracker.excess(), 0);
        assert_eq!(tracker.quota(), 0);
    }
}
