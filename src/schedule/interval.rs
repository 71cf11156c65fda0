//! Time windows produced by schedule steps.

use crate::services::clock::Timestamp;

/// A half-open window `[start, end)` in which a schedule wants its next
/// recurrence to begin. A driver sleeps until `start`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Interval {
    start: Timestamp,
    end: Timestamp,
}

impl Interval {
    /// A window between two instants; inverted bounds give the empty
    /// window.
    #[must_use]
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        if start >= end {
            Self::empty()
        } else {
            Self { start, end }
        }
    }

    /// The unbounded window from `start` on.
    #[must_use]
    pub fn after(start: Timestamp) -> Self {
        Self::new(start, Timestamp::MAX)
    }

    /// The empty window.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            start: Timestamp::ZERO,
            end: Timestamp::ZERO,
        }
    }

    #[must_use]
    pub fn start(&self) -> Timestamp {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Timestamp {
        self.end
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// The merged window when the two overlap or touch; `None` when they
    /// are disjoint.
    #[must_use]
    pub fn union(self, that: Interval) -> Option<Interval> {
        if self.is_empty() {
            return Some(that);
        }
        if that.is_empty() {
            return Some(self);
        }
        if self.start > that.end || that.start > self.end {
            return None;
        }
        Some(Interval {
            start: self.start.min(that.start),
            end: self.end.max(that.end),
        })
    }

    /// The overlap of the two windows, possibly empty.
    #[must_use]
    pub fn intersect(self, that: Interval) -> Interval {
        Interval::new(self.start.max(that.start), self.end.min(that.end))
    }

    /// The window that begins (then ends) earlier.
    #[must_use]
    pub fn min(self, that: Interval) -> Interval {
        if (self.start, self.end) <= (that.start, that.end) {
            self
        } else {
            that
        }
    }

    /// The window that begins (then ends) later.
    #[must_use]
    pub fn max(self, that: Interval) -> Interval {
        if (self.start, self.end) >= (that.start, that.end) {
            self
        } else {
            that
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn union_merges_overlap_and_touch() {
        let a = Interval::new(ts(0), ts(10));
        let b = Interval::new(ts(5), ts(20));
        assert_eq!(a.union(b), Some(Interval::new(ts(0), ts(20))));
        let touching = Interval::new(ts(10), ts(15));
        assert_eq!(a.union(touching), Some(Interval::new(ts(0), ts(15))));
    }

    #[test]
    fn union_rejects_disjoint() {
        let a = Interval::new(ts(0), ts(5));
        let b = Interval::new(ts(7), ts(9));
        assert_eq!(a.union(b), None);
    }

    #[test]
    fn intersect_of_disjoint_is_empty() {
        let a = Interval::new(ts(0), ts(5));
        let b = Interval::new(ts(7), ts(9));
        assert!(a.intersect(b).is_empty());
    }

    #[test]
    fn inverted_bounds_collapse_to_empty() {
        assert!(Interval::new(ts(9), ts(3)).is_empty());
    }
}
