//! Fiber Lifecycle Test Suite
//!
//! Conformance tests for fork/join, interruption, and resource safety.
//!
//! Test Coverage:
//! - fork/join reconciliation of fiber-local state
//! - interruption deferred across uninterruptible regions
//! - structured interruption of unjoined children
//! - release under interruption via acquire_release
//! - timeouts

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use filament::{
    acquire_release, Deferred, Effect, Exit, FiberRef, Never, Runtime, RuntimeConfig,
};

fn runtime() -> Runtime {
    RuntimeConfig::new().worker_threads(2).build()
}

/// A joined child's fiber-local writes become visible in the parent.
#[test]
fn join_reconciles_fiber_local_state_from_child() {
    let rt = runtime();
    let counter = FiberRef::new(0_u32);
    let child_ref = counter.clone();
    let after_join = counter.clone();

    let program = counter
        .set(1)
        .flat_map(move |()| child_ref.set(42).fork())
        .flat_map(|fiber| fiber.join())
        .flat_map(move |()| after_join.get());

    assert_eq!(rt.run(program), Exit::Success(42));
}

/// An unjoined child keeps its own view; the parent's value is untouched.
#[test]
fn forked_child_writes_stay_local_until_join() {
    let rt = runtime();
    let counter = FiberRef::new(7_u32);
    let child_ref = counter.clone();
    let after_fork = counter.clone();

    let program = child_ref
        .set(99)
        .fork()
        .flat_map(move |fiber| fiber.await_exit().flat_map(move |_| after_fork.get()));

    assert_eq!(rt.run(program), Exit::Success(7));
}

/// An interrupt arriving inside an uninterruptible region is held until
/// the region finishes, and nothing after the region runs.
#[test]
fn interrupt_waits_for_uninterruptible_region() {
    let rt = runtime();
    let entered = Deferred::<(), Never>::new();
    let region_done = Arc::new(AtomicBool::new(false));
    let after_region = Arc::new(AtomicBool::new(false));

    let mark_done = Arc::clone(&region_done);
    let mark_after = Arc::clone(&after_region);
    let signal = entered.clone();
    let child = signal
        .succeed(())
        .discard()
        .flat_map(|()| Effect::sleep(Duration::from_millis(50)))
        .flat_map(move |()| Effect::sync(move || mark_done.store(true, Ordering::SeqCst)))
        .uninterruptible()
        .flat_map(move |()| Effect::sync(move || mark_after.store(true, Ordering::SeqCst)));

    let program = child
        .fork()
        .flat_map(move |fiber| entered.wait().flat_map(move |()| fiber.interrupt()));

    let exit = rt.run(program);
    let child_exit = match exit {
        Exit::Success(child_exit) => child_exit,
        other => panic!("interrupt should succeed, got {other:?}"),
    };
    assert!(child_exit.is_interrupted(), "child should end interrupted");
    assert!(
        region_done.load(Ordering::SeqCst),
        "uninterruptible region should run to completion"
    );
    assert!(
        !after_region.load(Ordering::SeqCst),
        "nothing after the region should run"
    );
}

/// A parent that finishes without joining its children interrupts them,
/// and their finalizers run before the parent's exit is observable.
#[test]
fn finishing_parent_interrupts_unjoined_children() {
    let rt = runtime();
    let completed = Arc::new(AtomicBool::new(false));
    let cleaned = Arc::new(AtomicBool::new(false));

    let mark_completed = Arc::clone(&completed);
    let mark_cleaned = Arc::clone(&cleaned);
    let child = Effect::sleep(Duration::from_secs(30))
        .flat_map(move |()| Effect::sync(move || mark_completed.store(true, Ordering::SeqCst)))
        .ensuring(Effect::sync(move || {
            mark_cleaned.store(true, Ordering::SeqCst);
        }));

    let exit = rt.run(child.fork().discard());
    assert_eq!(exit, Exit::Success(()));
    assert!(
        cleaned.load(Ordering::SeqCst),
        "child finalizer should run before the parent settles"
    );
    assert!(
        !completed.load(Ordering::SeqCst),
        "child body should not survive its parent"
    );
}

/// Interrupting the user of an acquired resource still releases it.
#[test]
fn acquire_release_runs_release_on_interruption() {
    let rt = runtime();
    let acquired = Deferred::<(), Never>::new();
    let released = Arc::new(AtomicBool::new(false));

    let signal = acquired.clone();
    let mark_released = Arc::clone(&released);
    let guarded: Effect<(), Never> = acquire_release(
        Effect::succeed(()),
        move |()| {
            signal
                .succeed(())
                .discard()
                .flat_map(|()| Effect::sleep(Duration::from_secs(30)))
        },
        move |(), _exit| Effect::sync(move || mark_released.store(true, Ordering::SeqCst)),
    );

    let program = guarded
        .fork()
        .flat_map(move |fiber| acquired.wait().flat_map(move |()| fiber.interrupt()));

    let exit = rt.run(program);
    let child_exit = match exit {
        Exit::Success(child_exit) => child_exit,
        other => panic!("interrupt should succeed, got {other:?}"),
    };
    assert!(child_exit.is_interrupted(), "user should end interrupted");
    assert!(
        released.load(Ordering::SeqCst),
        "release should run despite interruption"
    );
}

/// A slow effect times out with `None`; a fast one completes with `Some`.
#[test]
fn timeout_cuts_off_slow_effects_only() {
    let rt = runtime();

    let slow = Effect::sleep(Duration::from_secs(30)).timeout(Duration::from_millis(20));
    assert_eq!(rt.run(slow), Exit::Success(None));

    let fast = Effect::<u32>::succeed(5).timeout(Duration::from_secs(30));
    assert_eq!(rt.run(fast), Exit::Success(Some(5)));
}
