//! Fiber identity.
//!
//! A fiber id pairs a process-wide sequence number with the fiber's start
//! time. The `(started_at, seq)` pair strictly orders fiber creation, which
//! is what the `FiberRefs` join algorithm relies on to find common
//! ancestors. A composite id is formed when two fibers jointly cause an
//! effect (the two sides of a race interrupting the loser, for example).

use crate::services::clock::Timestamp;
use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// The only ambient mutable global in the crate besides the fiber-ref id
// counter: monotonically increasing, never reset.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity of a fiber.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FiberId {
    /// No fiber: used for causes not attributable to a specific fiber, such
    /// as a queue shutdown interrupting its waiters.
    None,
    /// A generated id: sequence number plus start timestamp.
    Gen {
        /// Process-wide creation sequence number.
        seq: u64,
        /// Time the fiber started.
        started_at: Timestamp,
    },
    /// Two fibers jointly responsible for an effect.
    Composite(Arc<(FiberId, FiberId)>),
}

impl FiberId {
    /// Allocates a fresh id started at the given time.
    #[must_use]
    pub fn next(started_at: Timestamp) -> Self {
        Self::Gen {
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            started_at,
        }
    }

    /// Combines two ids into a composite id.
    #[must_use]
    pub fn composite(left: FiberId, right: FiberId) -> Self {
        Self::Composite(Arc::new((left, right)))
    }

    /// The `(started_at, seq)` creation-order key.
    ///
    /// Only generated ids carry a key; `None` sorts first and composites
    /// sort by their older member.
    #[must_use]
    pub fn order_key(&self) -> (u64, u64) {
        match self {
            Self::None => (0, 0),
            Self::Gen { seq, started_at } => (started_at.as_millis(), *seq),
            Self::Composite(pair) => pair.0.order_key().min(pair.1.order_key()),
        }
    }

    /// Returns true if `self` was created strictly after `other`.
    #[must_use]
    pub fn is_younger_than(&self, other: &FiberId) -> bool {
        self.order_key() > other.order_key()
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "fiber-none"),
            Self::Gen { seq, started_at } => write!(f, "fiber-{seq}@{started_at}"),
            Self::Composite(pair) => write!(f, "({} / {})", pair.0, pair.1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotonic() {
        let a = FiberId::next(Timestamp::ZERO);
        let b = FiberId::next(Timestamp::ZERO);
        assert!(b.is_younger_than(&a));
        assert!(!a.is_younger_than(&b));
    }

    #[test]
    fn start_time_dominates_ordering() {
        let late = FiberId::Gen {
            seq: 1,
            started_at: Timestamp::from_millis(100),
        };
        let early = FiberId::Gen {
            seq: 99,
            started_at: Timestamp::from_millis(1),
        };
        assert!(late.is_younger_than(&early));
    }

    #[test]
    fn composite_orders_by_older_member() {
        let a = FiberId::Gen {
            seq: 1,
            started_at: Timestamp::ZERO,
        };
        let b = FiberId::Gen {
            seq: 5,
            started_at: Timestamp::ZERO,
        };
        let c = FiberId::composite(b.clone(), a.clone());
        assert_eq!(c.order_key(), a.order_key());
    }
}
