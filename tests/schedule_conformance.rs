//! Schedule Driving Test Suite
//!
//! Conformance tests for schedules driven against a virtual clock: the
//! runtime's sleeps park on the clock and a test thread advances time.
//!
//! Test Coverage:
//! - repeat paces recurrences on the schedule's windows
//! - retry waits out the schedule's delay between attempts
//! - timeout fires on virtual time

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use filament::{
    repeat, retry, Clock, ClockService, Effect, Exit, Never, Runtime, RuntimeConfig, Schedule,
    Timestamp, VirtualClock,
};

fn virtual_runtime() -> (Runtime, Arc<VirtualClock>) {
    let clock = Arc::new(VirtualClock::new());
    let rt = RuntimeConfig::new()
        .worker_threads(2)
        .clock(ClockService(clock.clone()))
        .build();
    (rt, clock)
}

/// Advances the clock by `step` whenever a sleeper is parked on it.
fn ticker(clock: Arc<VirtualClock>, step: Duration) -> (Arc<AtomicBool>, JoinHandle<()>) {
    let stop = Arc::new(AtomicBool::new(false));
    let halt = Arc::clone(&stop);
    let handle = std::thread::spawn(move || {
        while !halt.load(Ordering::SeqCst) {
            if clock.pending() > 0 {
                clock.advance(step);
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    });
    (stop, handle)
}

/// `recurs(3)` intersected with one-second spacing runs the effect four
/// times, one second apart, and ends exactly three seconds in.
#[test]
fn repeat_paces_recurrences_on_the_virtual_clock() {
    let (rt, clock) = virtual_runtime();
    let (stop, advancer) = ticker(clock.clone(), Duration::from_secs(1));

    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    let schedule =
        Schedule::<(), u64>::recurs(3).intersect(Schedule::spaced(Duration::from_secs(1)));
    let exit = rt.run(repeat(
        move || {
            let counter = Arc::clone(&counter);
            Effect::<(), Never>::sync(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        },
        schedule,
    ));

    stop.store(true, Ordering::SeqCst);
    advancer.join().unwrap();

    assert_eq!(exit, Exit::Success((3, 3)));
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(clock.now(), Timestamp::from_millis(3_000));
}

/// Retry sleeps out the schedule's window between attempts and stops on
/// the first success.
#[test]
fn retry_spaces_attempts_on_the_virtual_clock() {
    let (rt, clock) = virtual_runtime();
    let (stop, advancer) = ticker(clock.clone(), Duration::from_secs(5));

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let exit = rt.run(retry(
        move || {
            let counter = Arc::clone(&counter);
            Effect::suspend(move || {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Effect::fail("not yet".to_string())
                } else {
                    Effect::succeed(())
                }
            })
        },
        Schedule::<String, u64>::spaced(Duration::from_secs(5)),
    ));

    stop.store(true, Ordering::SeqCst);
    advancer.join().unwrap();

    assert_eq!(exit, Exit::Success(()));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(clock.now(), Timestamp::from_millis(10_000));
}

/// A sleep far past the timeout is cut off at the timeout's deadline.
#[test]
fn timeout_fires_on_virtual_time() {
    let (rt, clock) = virtual_runtime();
    let (stop, advancer) = ticker(clock.clone(), Duration::from_secs(1));

    let exit = rt.run(Effect::sleep(Duration::from_secs(60)).timeout(Duration::from_secs(1)));

    stop.store(true, Ordering::SeqCst);
    advancer.join().unwrap();

    assert_eq!(exit, Exit::Success(None));
}
