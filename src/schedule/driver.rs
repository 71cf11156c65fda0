//! Running schedules against the clock.

use crate::cause::Defect;
use crate::effect::value::{Data, Never};
use crate::effect::{service, Effect};
use crate::schedule::{Decision, Schedule, ScheduleState};
use crate::services::clock::{ClockService, Timestamp};
use parking_lot::Mutex;
use std::sync::Arc;

/// The schedule declined to recur again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoMoreRecurrences;

impl std::fmt::Display for NoMoreRecurrences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("no more recurrences")
    }
}

impl std::error::Error for NoMoreRecurrences {}

struct DriverState<Out> {
    state: ScheduleState,
    last: Option<Out>,
}

/// A schedule bound to the ambient clock: stepping consults the current
/// time and sleeps out the window the schedule asks for.
pub struct Driver<In, Out> {
    schedule: Schedule<In, Out>,
    state: Arc<Mutex<DriverState<Out>>>,
}

impl<In, Out> Clone for Driver<In, Out> {
    fn clone(&self) -> Self {
        Self {
            schedule: self.schedule.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<In, Out> std::fmt::Debug for Driver<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Driver")
    }
}

impl<In: Data, Out: Data> Driver<In, Out> {
    #[must_use]
    pub fn new(schedule: Schedule<In, Out>) -> Self {
        let state = DriverState {
            state: schedule.initial_state(),
            last: None,
        };
        Self {
            schedule,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Feeds one input through the schedule. Sleeps until the window the
    /// schedule asks for opens, then succeeds with the step's output;
    /// fails once the schedule is done.
    #[must_use]
    pub fn next(&self, input: In) -> Effect<Out, NoMoreRecurrences> {
        let schedule = self.schedule.clone();
        let state = Arc::clone(&self.state);
        current_time()
            .widen_error::<NoMoreRecurrences>()
            .flat_map(move |now| {
                let (out, decision) = {
                    let mut guard = state.lock();
                    let (next, out, decision) = schedule.step(now, &input, &guard.state);
                    guard.state = next;
                    guard.last = Some(out.clone());
                    (out, decision)
                };
                match decision {
                    Decision::Done => Effect::fail(NoMoreRecurrences),
                    Decision::Continue(window) => {
                        let delay = window.start().duration_since(now);
                        Effect::sleep(delay)
                            .widen_error::<NoMoreRecurrences>()
                            .map(move |()| out)
                    }
                }
            })
    }

    /// The most recent output, if the driver has stepped at all.
    #[must_use]
    pub fn last(&self) -> Effect<Option<Out>, Never> {
        let state = Arc::clone(&self.state);
        Effect::sync(move || state.lock().last.clone())
    }

    /// Forgets all progress, as if freshly created.
    #[must_use]
    pub fn reset(&self) -> Effect<(), Never> {
        let schedule = self.schedule.clone();
        let state = Arc::clone(&self.state);
        Effect::sync(move || {
            let mut guard = state.lock();
            guard.state = schedule.initial_state();
            guard.last = None;
        })
    }
}

fn current_time() -> Effect<Timestamp, Never> {
    service::<ClockService>()
        .or_die()
        .map(|clock| clock.0.now())
}

type MakeFn<A, E> = dyn Fn() -> Effect<A, E> + Send + Sync;

/// Runs `make`'s effect, then again for every recurrence of `schedule`
/// (fed the effect's result), sleeping out the schedule's windows.
/// Succeeds with the schedule's final output; a failing effect fails the
/// whole repeat.
#[must_use]
pub fn repeat<A: Data, E: Data, Out: Data>(
    make: impl Fn() -> Effect<A, E> + Send + Sync + 'static,
    schedule: Schedule<A, Out>,
) -> Effect<Out, E> {
    let make: Arc<MakeFn<A, E>> = Arc::new(make);
    repeat_loop(make, Driver::new(schedule))
}

fn repeat_loop<A: Data, E: Data, Out: Data>(
    make: Arc<MakeFn<A, E>>,
    driver: Driver<A, Out>,
) -> Effect<Out, E> {
    Effect::suspend(move || {
        let again = Arc::clone(&make);
        make().flat_map(move |a| {
            let after = driver.clone();
            driver
                .next(a)
                .either()
                .widen_error::<E>()
                .flat_map(move |stepped| match stepped {
                    Ok(_) => repeat_loop(again, after),
                    Err(NoMoreRecurrences) => {
                        after.last().widen_error::<E>().flat_map(|out| match out {
                            Some(out) => Effect::succeed(out),
                            None => Effect::die(Defect::new(
                                "schedule finished before its first step",
                            )),
                        })
                    }
                })
        })
    })
}

/// Runs `make`'s effect, retrying typed failures for as long as `schedule`
/// (fed the error) recurs, sleeping out its windows between attempts. Once
/// the schedule is done the last error is returned. Defects and
/// interruption are never retried.
#[must_use]
pub fn retry<A: Data, E: Data, Out: Data>(
    make: impl Fn() -> Effect<A, E> + Send + Sync + 'static,
    schedule: Schedule<E, Out>,
) -> Effect<A, E> {
    let make: Arc<MakeFn<A, E>> = Arc::new(make);
    retry_loop(make, Driver::new(schedule))
}

fn retry_loop<A: Data, E: Data, Out: Data>(
    make: Arc<MakeFn<A, E>>,
    driver: Driver<E, Out>,
) -> Effect<A, E> {
    Effect::suspend(move || {
        let again = Arc::clone(&make);
        make().catch_all(move |error| {
            let original = error.clone();
            driver
                .clone()
                .next(error)
                .either()
                .widen_error::<E>()
                .flat_map(move |stepped| match stepped {
                    Ok(_) => retry_loop(again, driver),
                    Err(NoMoreRecurrences) => Effect::fail(original),
                })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::Exit;
    use crate::runtime::RuntimeConfig;

    fn runtime() -> crate::runtime::Runtime {
        RuntimeConfig::new().worker_threads(2).build()
    }

    #[test]
    fn repeat_runs_effect_once_per_recurrence_plus_one() {
        let rt = runtime();
        let runs = Arc::new(Mutex::new(0_u32));
        let counter = Arc::clone(&runs);
        let exit = rt.run(repeat(
            move || {
                let counter = Arc::clone(&counter);
                Effect::<(), Never>::sync(move || *counter.lock() += 1)
            },
            Schedule::<(), u64>::recurs(2),
        ));
        assert_eq!(exit, Exit::Success(2));
        assert_eq!(*runs.lock(), 3);
    }

    #[test]
    fn retry_stops_after_success() {
        let rt = runtime();
        let attempts = Arc::new(Mutex::new(0_u32));
        let counter = Arc::clone(&attempts);
        let exit = rt.run(retry(
            move || {
                let counter = Arc::clone(&counter);
                Effect::suspend(move || {
                    let mut n = counter.lock();
                    *n += 1;
                    if *n < 3 {
                        Effect::fail("flaky".to_string())
                    } else {
                        Effect::succeed(*n)
                    }
                })
            },
            Schedule::<String, u64>::recurs(5),
        ));
        assert_eq!(exit, Exit::Success(3));
        assert_eq!(*attempts.lock(), 3);
    }

    #[test]
    fn retry_gives_up_with_the_last_error() {
        let rt = runtime();
        let exit = rt.run(retry(
            || Effect::<u32, String>::fail("always".to_string()),
            Schedule::<String, u64>::recurs(1),
        ));
        assert_eq!(exit, Exit::fail("always".to_string()));
    }
}
