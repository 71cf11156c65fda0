//! Software Transactional Memory Test Suite
//!
//! Conformance tests for transaction atomicity, isolation, and retry.
//!
//! Test Coverage:
//! - concurrent increments never lose updates
//! - transfers between refs preserve the combined balance
//! - retry parks a transaction until a read ref changes

use filament::{atomically, Effect, Exit, Never, Runtime, RuntimeConfig, Stm, TRef};

fn runtime() -> Runtime {
    RuntimeConfig::new().worker_threads(4).build()
}

fn increments(cell: TRef<u64>, n: u32) -> Effect<(), Never> {
    if n == 0 {
        Effect::succeed(())
    } else {
        let rest = cell.clone();
        atomically(cell.update(|v| v + 1)).flat_map(move |()| increments(rest, n - 1))
    }
}

/// Two fibers hammering the same ref commit every increment exactly once.
#[test]
fn concurrent_increments_never_lose_updates() {
    let rt = runtime();
    let program = TRef::make(0_u64).flat_map(|cell| {
        let left = increments(cell.clone(), 100);
        let right = increments(cell.clone(), 100);
        left.zip_par(right).flat_map(move |((), ())| cell.get())
    });
    assert_eq!(rt.run(program), Exit::Success(200));
}

fn transfer(from: &TRef<i64>, to: &TRef<i64>) -> Stm<(), Never> {
    let debit = from.clone();
    let credit = to.clone();
    from.read().flat_map(move |x| {
        let credit = credit.clone();
        debit.write(x - 1).flat_map(move |()| {
            let credit_inner = credit.clone();
            credit.read().flat_map(move |y| credit_inner.write(y + 1))
        })
    })
}

fn transfers(from: TRef<i64>, to: TRef<i64>, n: u32) -> Effect<(), Never> {
    if n == 0 {
        Effect::succeed(())
    } else {
        let step = atomically(transfer(&from, &to));
        step.flat_map(move |()| transfers(from, to, n - 1))
    }
}

/// Concurrent transfers in both directions preserve the total.
#[test]
fn transfers_preserve_the_combined_balance() {
    let rt = runtime();
    let program = TRef::make(100_i64).flat_map(|a| {
        TRef::make(100_i64).flat_map(move |b| {
            let forward = transfers(a.clone(), b.clone(), 50);
            let backward = transfers(b.clone(), a.clone(), 30);
            forward.zip_par(backward).flat_map(move |((), ())| {
                let b_final = b.clone();
                a.get().flat_map(move |x| b_final.get().map(move |y| (x, y)))
            })
        })
    });
    assert_eq!(rt.run(program), Exit::Success((80, 120)));
}

/// A transaction that finds its condition unmet parks, and the fiber
/// resumes with the new value once another commit touches the ref.
#[test]
fn retry_parks_until_a_read_ref_changes() {
    let rt = runtime();
    let program = TRef::make(0_i64).flat_map(|cell| {
        let watched = cell.clone();
        let consumer = atomically(
            watched
                .read()
                .flat_map(|v| Stm::check(v > 0).map(move |()| v)),
        );
        consumer
            .fork()
            .flat_map(move |fiber| cell.set(41).flat_map(move |()| fiber.join()))
    });
    assert_eq!(rt.run(program), Exit::Success(41));
}
