//! Global pull-request quota.
//!
//! The quota caps how many eager pull requests the ingest path may issue over
//! the lifetime of the process. It only ever goes down, one unit at a time,
//! through a compare-and-swap loop. A configuration reload may replace the
//! whole value.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Atomic, decrement-only counter bounding the number of pull requests.
#[derive(Debug)]
pub struct QuotaGate {
    remaining: AtomicU64,
}

impl QuotaGate {
    pub fn new(initial: u64) -> Self {
        publish_remaining(initial);
        Self {
            remaining: AtomicU64::new(initial),
        }
    }

    /// Consume one unit of quota if any is left.
    ///
    /// Returns `false` without touching the counter once it reaches zero. When
    /// several callers race on the last unit exactly one of them wins.
    pub fn try_consume(&self) -> bool {
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            }) {
            // Racing consumers may publish out of order; the admission loop
            // re-samples the gauge every tick.
            Ok(previous) => {
                publish_remaining(previous - 1);
                true
            }
            Err(_) => false,
        }
    }

    /// Snapshot of the remaining quota. Only good for gating decisions.
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Set the `admission.quota.remaining` gauge from the current value.
    pub fn publish(&self) {
        publish_remaining(self.remaining());
    }

    /// Replace the whole quota value, returning the previous one.
    ///
    /// Only configuration reloads call this.
    pub fn reset(&self, value: u64) -> u64 {
        let previous = self.remaining.swap(value, Ordering::AcqRel);
        publish_remaining(value);
        info!(previous, remaining = value, "Quota reset");
        previous
    }
}

fn publish_remaining(value: u64) {
    metrics::gauge!("admission.quota.remaining").set(value as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_consume_until_exhausted() {
        let gate = QuotaGate::new(2);

        assert!(gate.try_consume());
        assert_eq!(gate.remaining(), 1);
        assert!(gate.try_consume());
        assert_eq!(gate.remaining(), 0);
        assert!(gate.is_exhausted());

        // Exhausted gate stays at zero
        assert!(!gate.try_consume());
        assert!(!gate.try_consume());
        assert_eq!(gate.remaining(), 0);
    }

    #[test]
    fn test_zero_quota_never_consumes() {
        let gate = QuotaGate::new(0);
        assert!(!gate.try_consume());
        assert_eq!(gate.remaining(), 0);
    }

    #[test]
    fn test_concurrent_consumers_never_exceed_quota() {
        let gate = QuotaGate::new(500);
        let successes = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1_000 {
                        if gate.try_consume() {
                            successes.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(successes.load(Ordering::Relaxed), 500);
        assert_eq!(gate.remaining(), 0);
    }

    #[test]
    fn test_single_unit_has_exactly_one_winner() {
        for _ in 0..200 {
            let gate = QuotaGate::new(1);
            let barrier = Barrier::new(2);
            let wins = AtomicUsize::new(0);

            std::thread::scope(|scope| {
                for _ in 0..2 {
                    scope.spawn(|| {
                        barrier.wait();
                        if gate.try_consume() {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            });

            assert_eq!(wins.load(Ordering::Relaxed), 1);
            assert_eq!(gate.remaining(), 0);
        }
    }

    #[test]
    fn test_reset_replaces_value() {
        let gate = QuotaGate::new(1);
        assert!(gate.try_consume());
        assert!(gate.is_exhausted());

        assert_eq!(gate.reset(3), 0);
        assert_eq!(gate.remaining(), 3);
        assert!(gate.try_consume());
        assert_eq!(gate.remaining(), 2);
    }
}
