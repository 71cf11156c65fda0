//! Clock service: current time and deadline-driven wakeups.
//!
//! Two implementations are provided:
//!
//! - [`WallClock`]: real time, with a dedicated timer thread draining a
//!   min-heap of deadlines.
//! - [`VirtualClock`]: logical time advanced manually, for deterministic
//!   schedule and timeout tests. Time never moves unless [`VirtualClock::advance`]
//!   is called.
//!
//! The clock is injected through the environment as a [`ClockService`], not
//! reached through a global, so a fiber tree can run against either clock.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

/// A point in time, in milliseconds.
///
/// For [`WallClock`] this is milliseconds since the Unix epoch; for
/// [`VirtualClock`] it is milliseconds since clock creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp.
    pub const ZERO: Self = Self(0);

    /// The largest representable timestamp.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a timestamp from milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// This timestamp in milliseconds.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Adds a duration, saturating at [`Timestamp::MAX`].
    #[must_use]
    pub fn saturating_add(self, d: Duration) -> Self {
        let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// The duration from `earlier` to `self`, or zero if `earlier` is later.
    #[must_use]
    pub fn duration_since(self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Callback fired when a scheduled deadline is reached.
pub type WakeFn = Box<dyn FnOnce() + Send>;

/// Key identifying a scheduled wakeup, for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SleepKey(u64);

/// Time source plus deadline scheduling.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> Timestamp;

    /// Schedules `wake` to fire once the clock reaches `deadline`.
    ///
    /// A deadline at or before [`Clock::now`] fires promptly (for the wall
    /// clock, on the timer thread; for the virtual clock, on the next
    /// `advance`, including `advance` by zero).
    fn schedule(&self, deadline: Timestamp, wake: WakeFn) -> SleepKey;

    /// Cancels a scheduled wakeup. A no-op if the wakeup already fired.
    fn cancel(&self, key: SleepKey);
}

/// The clock as an environment service.
#[derive(Clone)]
pub struct ClockService(pub Arc<dyn Clock>);

impl std::fmt::Debug for ClockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClockService")
    }
}

// ============================================================================
// Timer heap (shared by both clocks)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerEntry {
    deadline: Timestamp,
    key: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    // Cancelled entries keep their heap slot; the wake map is authoritative.
    wakes: HashMap<u64, WakeFn>,
}

impl TimerHeap {
    fn insert(&mut self, key: u64, deadline: Timestamp, wake: WakeFn) {
        self.heap.push(TimerEntry { deadline, key });
        self.wakes.insert(key, wake);
    }

    fn cancel(&mut self, key: u64) {
        self.wakes.remove(&key);
    }

    fn peek_deadline(&mut self) -> Option<Timestamp> {
        while let Some(entry) = self.heap.peek() {
            if self.wakes.contains_key(&entry.key) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes every live wake with a deadline at or before `now`.
    fn pop_expired(&mut self, now: Timestamp) -> Vec<WakeFn> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = *entry;
            self.heap.pop();
            if let Some(wake) = self.wakes.remove(&entry.key) {
                expired.push(wake);
            }
        }
        expired
    }
}

// ============================================================================
// WallClock
// ============================================================================

struct WallClockShared {
    timers: Mutex<TimerHeap>,
    cond: Condvar,
    shutdown: AtomicBool,
    next_key: AtomicU64,
}

/// Real time, backed by a timer thread.
pub struct WallClock {
    shared: Arc<WallClockShared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WallClock {
    /// Creates a wall clock and starts its timer thread.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(WallClockShared {
            timers: Mutex::new(TimerHeap::default()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_key: AtomicU64::new(0),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("filament-timer".into())
                .spawn(move || timer_loop(&shared))
                .ok()
        };
        Self { shared, thread }
    }

    fn wall_now() -> Timestamp {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp::from_millis(u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX))
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

fn timer_loop(shared: &WallClockShared) {
    let mut timers = shared.timers.lock();
    loop {
        if shared.shutdown.load(AtomicOrdering::Acquire) {
            return;
        }
        let now = WallClock::wall_now();
        let expired = timers.pop_expired(now);
        if !expired.is_empty() {
            drop(timers);
            for wake in expired {
                wake();
            }
            timers = shared.timers.lock();
            continue;
        }
        match timers.peek_deadline() {
            Some(deadline) => {
                let wait = deadline.duration_since(now);
                shared.cond.wait_for(&mut timers, wait);
            }
            None => shared.cond.wait(&mut timers),
        }
    }
}

impl Clock for WallClock {
    fn now(&self) -> Timestamp {
        Self::wall_now()
    }

    fn schedule(&self, deadline: Timestamp, wake: WakeFn) -> SleepKey {
        let key = self.shared.next_key.fetch_add(1, AtomicOrdering::Relaxed);
        self.shared.timers.lock().insert(key, deadline, wake);
        self.shared.cond.notify_one();
        SleepKey(key)
    }

    fn cancel(&self, key: SleepKey) {
        self.shared.timers.lock().cancel(key.0);
    }
}

impl Drop for WallClock {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);
        self.shared.cond.notify_all();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// VirtualClock
// ============================================================================

struct VirtualState {
    now: Timestamp,
    timers: TimerHeap,
    next_key: u64,
}

/// Logical time under test control.
///
/// Scheduled wakeups fire only inside [`advance`](VirtualClock::advance) (or
/// [`set_time`](VirtualClock::set_time)), on the advancing thread, after the
/// internal lock is released.
pub struct VirtualClock {
    state: Mutex<VirtualState>,
}

impl VirtualClock {
    /// Creates a virtual clock at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VirtualState {
                now: Timestamp::ZERO,
                timers: TimerHeap::default(),
                next_key: 0,
            }),
        }
    }

    /// Advances the clock, firing every wakeup whose deadline is reached.
    pub fn advance(&self, d: Duration) {
        let expired = {
            let mut state = self.state.lock();
            state.now = state.now.saturating_add(d);
            let now = state.now;
            state.timers.pop_expired(now)
        };
        for wake in expired {
            wake();
        }
    }

    /// Jumps the clock to an absolute time (never backwards).
    pub fn set_time(&self, to: Timestamp) {
        let expired = {
            let mut state = self.state.lock();
            if to > state.now {
                state.now = to;
            }
            let now = state.now;
            state.timers.pop_expired(now)
        };
        for wake in expired {
            wake();
        }
    }

    /// The number of pending wakeups, for test assertions.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().timers.wakes.len()
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Timestamp {
        self.state.lock().now
    }

    fn schedule(&self, deadline: Timestamp, wake: WakeFn) -> SleepKey {
        let mut state = self.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        state.timers.insert(key, deadline, wake);
        SleepKey(key)
    }

    fn cancel(&self, key: SleepKey) {
        self.state.lock().timers.cancel(key.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn virtual_clock_fires_in_deadline_order() {
        let clock = VirtualClock::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for (label, at) in [("b", 20_u64), ("a", 10), ("c", 30)] {
            let fired = Arc::clone(&fired);
            clock.schedule(
                Timestamp::from_millis(at),
                Box::new(move || fired.lock().push(label)),
            );
        }
        clock.advance(Duration::from_millis(25));
        assert_eq!(*fired.lock(), vec!["a", "b"]);
        clock.advance(Duration::from_millis(5));
        assert_eq!(*fired.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cancelled_wakeup_never_fires() {
        let clock = VirtualClock::new();
        let count = Arc::new(AtomicUsize::new(0));
        let key = {
            let count = Arc::clone(&count);
            clock.schedule(
                Timestamp::from_millis(5),
                Box::new(move || {
                    count.fetch_add(1, AtomicOrdering::SeqCst);
                }),
            )
        };
        clock.cancel(key);
        clock.advance(Duration::from_millis(10));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn wall_clock_schedules_and_fires() {
        let clock = WallClock::new();
        let (lock, cond) = (Mutex::new(false), Condvar::new());
        let pair = Arc::new((lock, cond));
        {
            let pair = Arc::clone(&pair);
            clock.schedule(
                clock.now().saturating_add(Duration::from_millis(10)),
                Box::new(move || {
                    *pair.0.lock() = true;
                    pair.1.notify_all();
                }),
            );
        }
        let mut done = pair.0.lock();
        if !*done {
            pair.1.wait_for(&mut done, Duration::from_secs(5));
        }
        assert!(*done);
    }
}
