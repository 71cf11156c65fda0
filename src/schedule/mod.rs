//! Schedules: pure descriptions of recurrence.
//!
//! A [`Schedule`] is a state machine stepped with the current time and an
//! input; each step yields an output, the next state, and a [`Decision`]:
//! either done, or continue within a time [`Interval`] whose start is when
//! the next recurrence may begin. Stepping is pure, which keeps the
//! algebra testable without a clock; the [`Driver`] adds real time and
//! sleeping, and [`repeat`]/[`retry`] tie a schedule to an effect.

mod driver;
mod interval;

pub use driver::{repeat, retry, Driver, NoMoreRecurrences};
pub use interval::Interval;

use crate::effect::value::{erase, unerase, AnyValue};
use crate::effect::Data;
use crate::services::clock::Timestamp;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// What a schedule wants after one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Recur again, no earlier than the window's start.
    Continue(Interval),
    /// No more recurrences.
    Done,
}

/// A schedule's opaque per-run state.
#[derive(Clone)]
pub struct ScheduleState(AnyValue);

impl std::fmt::Debug for ScheduleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScheduleState")
    }
}

type StepFn<In, Out> = dyn Fn(Timestamp, &In, AnyValue) -> (AnyValue, Out, Decision) + Send + Sync;

/// A pure recurrence policy consuming `In` values and emitting `Out`s.
pub struct Schedule<In, Out> {
    initial: AnyValue,
    step: Arc<StepFn<In, Out>>,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out> Clone for Schedule<In, Out> {
    fn clone(&self) -> Self {
        Self {
            initial: Arc::clone(&self.initial),
            step: Arc::clone(&self.step),
            _marker: PhantomData,
        }
    }
}

impl<In, Out> std::fmt::Debug for Schedule<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Schedule")
    }
}

impl<In: 'static, Out: Data> Schedule<In, Out> {
    fn from_step(
        initial: AnyValue,
        step: impl Fn(Timestamp, &In, AnyValue) -> (AnyValue, Out, Decision) + Send + Sync + 'static,
    ) -> Self {
        Self {
            initial,
            step: Arc::new(step),
            _marker: PhantomData,
        }
    }

    /// The state a fresh run starts from.
    #[must_use]
    pub fn initial_state(&self) -> ScheduleState {
        ScheduleState(Arc::clone(&self.initial))
    }

    /// One pure step: no clock access, no side effects.
    #[must_use]
    pub fn step(
        &self,
        now: Timestamp,
        input: &In,
        state: &ScheduleState,
    ) -> (ScheduleState, Out, Decision) {
        let (next, out, decision) = (self.step)(now, input, Arc::clone(&state.0));
        (ScheduleState(next), out, decision)
    }

    /// Transforms every output.
    #[must_use]
    pub fn map<Out2: Data>(
        self,
        f: impl Fn(Out) -> Out2 + Send + Sync + 'static,
    ) -> Schedule<In, Out2> {
        let step = self.step;
        Schedule::from_step(self.initial, move |now, input, state| {
            let (next, out, decision) = step(now, input, state);
            (next, f(out), decision)
        })
    }

    /// Recurs while either side does. The combined window is the union of
    /// the two when they meet, otherwise the earlier one.
    #[must_use]
    pub fn union<Out2: Data>(self, that: Schedule<In, Out2>) -> Schedule<In, (Out, Out2)> {
        let left = self.step;
        let right = that.step;
        let initial = erase((self.initial, that.initial));
        Schedule::from_step(initial, move |now, input, state| {
            let (ls, rs) = unerase::<(AnyValue, AnyValue)>(state);
            let (ls, lo, ld) = left(now, input, ls);
            let (rs, ro, rd) = right(now, input, rs);
            let decision = match (ld, rd) {
                (Decision::Continue(a), Decision::Continue(b)) => {
                    Decision::Continue(a.union(b).unwrap_or_else(|| a.min(b)))
                }
                (Decision::Continue(window), Decision::Done)
                | (Decision::Done, Decision::Continue(window)) => Decision::Continue(window),
                (Decision::Done, Decision::Done) => Decision::Done,
            };
            (erase((ls, rs)), (lo, ro), decision)
        })
    }

    /// Recurs while both sides do. The combined window is the overlap of
    /// the two, or the later one when they do not meet.
    #[must_use]
    pub fn intersect<Out2: Data>(self, that: Schedule<In, Out2>) -> Schedule<In, (Out, Out2)> {
        let left = self.step;
        let right = that.step;
        let initial = erase((self.initial, that.initial));
        Schedule::from_step(initial, move |now, input, state| {
            let (ls, rs) = unerase::<(AnyValue, AnyValue)>(state);
            let (ls, lo, ld) = left(now, input, ls);
            let (rs, ro, rd) = right(now, input, rs);
            let decision = match (ld, rd) {
                (Decision::Continue(a), Decision::Continue(b)) => {
                    let overlap = a.intersect(b);
                    Decision::Continue(if overlap.is_empty() { a.max(b) } else { overlap })
                }
                _ => Decision::Done,
            };
            (erase((ls, rs)), (lo, ro), decision)
        })
    }
}

impl<In: 'static> Schedule<In, u64> {
    /// Recurs forever, immediately, counting recurrences.
    #[must_use]
    pub fn forever() -> Self {
        Self::from_step(erase(0_u64), |now, _, state| {
            let count = unerase::<u64>(state);
            (
                erase(count + 1),
                count,
                Decision::Continue(Interval::after(now)),
            )
        })
    }

    /// Recurs `times` times, immediately, then is done.
    #[must_use]
    pub fn recurs(times: u64) -> Self {
        Self::from_step(erase(0_u64), move |now, _, state| {
            let count = unerase::<u64>(state);
            if count < times {
                (
                    erase(count + 1),
                    count,
                    Decision::Continue(Interval::after(now)),
                )
            } else {
                (erase(count), count, Decision::Done)
            }
        })
    }

    /// Recurs exactly once.
    #[must_use]
    pub fn once() -> Self {
        Self::recurs(1)
    }

    /// Recurs forever, waiting `interval` after each step.
    #[must_use]
    pub fn spaced(interval: Duration) -> Self {
        Self::from_step(erase(0_u64), move |now, _, state| {
            let count = unerase::<u64>(state);
            (
                erase(count + 1),
                count,
                Decision::Continue(Interval::after(now.saturating_add(interval))),
            )
        })
    }

    /// Recurs forever on boundaries anchored at the first step: the `k`-th
    /// window opens `k * period` after the run began, with no drift from
    /// slow effects.
    #[must_use]
    pub fn fixed(period: Duration) -> Self {
        let period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX).max(1);
        Self::from_step(
            erase((None::<Timestamp>, 0_u64)),
            move |now, _, state| {
                let (anchor, count) = unerase::<(Option<Timestamp>, u64)>(state);
                let anchor = anchor.unwrap_or(now);
                let elapsed = now.duration_since(anchor).as_millis() as u64;
                let k = elapsed / period_ms + 1;
                let boundary = anchor.saturating_add(Duration::from_millis(k * period_ms));
                (
                    erase((Some(anchor), count + 1)),
                    count,
                    Decision::Continue(Interval::after(boundary)),
                )
            },
        )
    }

    /// Recurs forever with delays growing geometrically: `base`, then
    /// `base * factor`, and so on.
    #[must_use]
    pub fn exponential(base: Duration, factor: f64) -> Self {
        Self::from_step(erase(0_u64), move |now, _, state| {
            let count = unerase::<u64>(state);
            let scale = factor.powi(i32::try_from(count).unwrap_or(i32::MAX));
            let delay_ms = (base.as_millis() as f64 * scale).max(0.0);
            let delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);
            (
                erase(count + 1),
                count,
                Decision::Continue(Interval::after(now.saturating_add(delay))),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn window(decision: Decision) -> Interval {
        match decision {
            Decision::Continue(interval) => interval,
            Decision::Done => panic!("expected a continue decision"),
        }
    }

    #[test]
    fn recurs_continues_then_finishes() {
        let schedule = Schedule::<(), u64>::recurs(2);
        let s0 = schedule.initial_state();
        let (s1, out, d) = schedule.step(ts(0), &(), &s0);
        assert_eq!(out, 0);
        assert!(matches!(d, Decision::Continue(_)));
        let (s2, _, d) = schedule.step(ts(1), &(), &s1);
        assert!(matches!(d, Decision::Continue(_)));
        let (_, out, d) = schedule.step(ts(2), &(), &s2);
        assert_eq!(out, 2);
        assert_eq!(d, Decision::Done);
    }

    #[test]
    fn recurs_intersect_spaced_paces_three_recurrences() {
        let schedule =
            Schedule::<(), u64>::recurs(3).intersect(Schedule::spaced(Duration::from_secs(1)));
        let mut state = schedule.initial_state();
        let mut now = ts(0);
        for i in 0..3 {
            let (next, (count, _), decision) = schedule.step(now, &(), &state);
            assert_eq!(count, i);
            let interval = window(decision);
            assert_eq!(interval.start(), now.saturating_add(Duration::from_secs(1)));
            now = interval.start();
            state = next;
        }
        let (_, _, decision) = schedule.step(now, &(), &state);
        assert_eq!(decision, Decision::Done);
    }

    #[test]
    fn union_takes_earlier_window_and_outlives_both() {
        let schedule = Schedule::<(), u64>::spaced(Duration::from_secs(5))
            .union(Schedule::recurs(1));
        let s0 = schedule.initial_state();
        let (s1, _, d) = schedule.step(ts(0), &(), &s0);
        // recurs side allows an immediate recurrence.
        assert_eq!(window(d).start(), ts(0));
        let (_, _, d) = schedule.step(ts(0), &(), &s1);
        // recurs side is done; only the spaced window remains.
        assert_eq!(window(d).start(), ts(5_000));
    }

    #[test]
    fn fixed_anchors_boundaries_without_drift() {
        let schedule = Schedule::<(), u64>::fixed(Duration::from_millis(100));
        let s0 = schedule.initial_state();
        let (s1, _, d) = schedule.step(ts(10), &(), &s0);
        assert_eq!(window(d).start(), ts(110));
        // A slow effect overshoots the second boundary; the third stays on
        // the anchored grid.
        let (_, _, d) = schedule.step(ts(245), &(), &s1);
        assert_eq!(window(d).start(), ts(310));
    }

    #[test]
    fn exponential_doubles_delays() {
        let schedule = Schedule::<(), u64>::exponential(Duration::from_millis(10), 2.0);
        let s0 = schedule.initial_state();
        let (s1, _, d) = schedule.step(ts(0), &(), &s0);
        assert_eq!(window(d).start(), ts(10));
        let (s2, _, d) = schedule.step(ts(10), &(), &s1);
        assert_eq!(window(d).start(), ts(30));
        let (_, _, d) = schedule.step(ts(30), &(), &s2);
        assert_eq!(window(d).start(), ts(70));
    }
}
