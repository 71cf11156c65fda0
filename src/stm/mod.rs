//! Software transactional memory.
//!
//! An [`Stm`] value is a re-runnable description of a transaction over
//! [`TRef`] cells. Running one ([`Stm::commit`]) executes attempts against
//! a private [`Journal`]: reads record the version they observed, writes
//! stay journal-local, and at the end the attempt validates every observed
//! version under the refs' locks (taken in global id order) before the
//! writes become visible atomically. An invalidated attempt is discarded
//! and rerun from scratch; [`Stm::retry`] parks the fiber until some ref
//! the attempt read is committed by another transaction.
//!
//! Transaction bodies run many times and must stay pure: no effects, no
//! shared mutation, just journal reads and writes.

mod journal;
mod tref;

pub use tref::TRef;

use crate::cause::{Defect, DynCause};
use crate::effect::value::{erase, unerase, AnyValue, Data, Never};
use crate::effect::{Effect, Expr};
use crate::fiber::FiberId;
use journal::Journal;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tref::{TRefInner, Waiter};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// How one attempt of a transaction ended. Strictly attempt-local; only
/// commit-time validation decides whether the outcome stands.
pub(crate) enum TExit {
    Succeed(AnyValue),
    Fail(AnyValue),
    Die(Defect),
    Interrupt(FiberId),
    Retry,
}

type RunFn = dyn Fn(&mut Journal) -> TExit + Send + Sync;

/// A composable transaction producing an `A` or failing with an `E`.
pub struct Stm<A, E = Never> {
    run: Arc<RunFn>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
            _marker: PhantomData,
        }
    }
}

impl<A, E> std::fmt::Debug for Stm<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Stm")
    }
}

impl<A: Data, E: Data> Stm<A, E> {
    pub(crate) fn from_run(run: impl Fn(&mut Journal) -> TExit + Send + Sync + 'static) -> Self {
        Self {
            run: Arc::new(run),
            _marker: PhantomData,
        }
    }

    /// A transaction that succeeds with `value`.
    #[must_use]
    pub fn succeed(value: A) -> Self {
        Self::from_run(move |_| TExit::Succeed(erase(value.clone())))
    }

    /// A transaction that succeeds with a freshly computed value.
    #[must_use]
    pub fn succeed_with(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self::from_run(move |_| TExit::Succeed(erase(f())))
    }

    /// A transaction that fails with `error`.
    #[must_use]
    pub fn fail(error: E) -> Self {
        Self::from_run(move |_| TExit::Fail(erase(error.clone())))
    }

    /// A transaction that dies with a defect.
    #[must_use]
    pub fn die(defect: Defect) -> Self {
        Self::from_run(move |_| TExit::Die(defect.clone()))
    }

    /// Abandons the attempt and parks the fiber until a ref this attempt
    /// read is committed by another transaction, then reruns from scratch.
    #[must_use]
    pub fn retry() -> Self {
        Self::from_run(|_| TExit::Retry)
    }

    /// A transaction that interrupts the committing fiber.
    #[must_use]
    pub fn interrupt() -> Self {
        Self::from_run(|_| TExit::Interrupt(FiberId::None))
    }

    #[must_use]
    pub fn map<B: Data>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Stm<B, E> {
        self.flat_map(move |a| Stm::succeed(f(a)))
    }

    #[must_use]
    pub fn flat_map<B: Data>(
        self,
        k: impl Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    ) -> Stm<B, E> {
        let run = self.run;
        Stm::from_run(move |journal| match run(journal) {
            TExit::Succeed(value) => {
                let next = k(unerase::<A>(value));
                (next.run)(journal)
            }
            other => other,
        })
    }

    /// Sequences two transactions, keeping both results.
    #[must_use]
    pub fn zip<B: Data>(self, that: Stm<B, E>) -> Stm<(A, B), E> {
        self.flat_map(move |a| that.clone().map(move |b| (a.clone(), b)))
    }

    /// Tries `self`; on typed failure or retry, restores the journal to the
    /// state before `self` ran and runs `that` instead. Defects propagate.
    #[must_use]
    pub fn or_else(self, that: Stm<A, E>) -> Stm<A, E> {
        let left = self.run;
        let right = that.run;
        Stm::from_run(move |journal| {
            let saved = journal.snapshot();
            match left(journal) {
                TExit::Fail(_) | TExit::Retry => {
                    journal.restore(saved);
                    right(journal)
                }
                other => other,
            }
        })
    }

    #[must_use]
    pub fn map_error<F: Data>(self, f: impl Fn(E) -> F + Send + Sync + 'static) -> Stm<A, F> {
        let run = self.run;
        Stm::from_run(move |journal| match run(journal) {
            TExit::Fail(error) => TExit::Fail(erase(f(unerase::<E>(error)))),
            other => other,
        })
    }

    /// Runs the transaction to completion as an effect.
    #[must_use]
    pub fn commit(self) -> Effect<A, E> {
        attempt::<A, E>(self.run)
    }
}

impl<E: Data> Stm<(), E> {
    /// Retries unless the condition holds. Meant to be used inside a
    /// `flat_map`, where the condition is recomputed on every attempt.
    #[must_use]
    pub fn check(condition: bool) -> Self {
        if condition {
            Stm::succeed(())
        } else {
            Stm::retry()
        }
    }
}

impl<A: Data> Stm<A, Never> {
    /// Reinterprets an infallible transaction at any error type.
    #[must_use]
    pub fn widen_error<F: Data>(self) -> Stm<A, F> {
        Stm {
            run: self.run,
            _marker: PhantomData,
        }
    }
}

/// Runs a transaction to completion as an effect.
#[must_use]
pub fn atomically<A: Data, E: Data>(stm: Stm<A, E>) -> Effect<A, E> {
    stm.commit()
}

struct RetryWaiter {
    handle: crate::fiber::cell::ResumeHandle,
    next: Box<dyn Fn() -> Expr + Send + Sync>,
}

impl Waiter for RetryWaiter {
    fn fired(&self) -> bool {
        self.handle.is_fired()
    }

    fn wake(&self) {
        self.handle.resume((self.next)());
    }
}

/// One full run of a transaction: a single attempt per interpreter step,
/// rerun on invalidation, parked on retry.
fn attempt<A: Data, E: Data>(run: Arc<RunFn>) -> Effect<A, E> {
    Effect::from_expr(Expr::Stateful(Box::new(move |rt| {
        let me = rt.id().clone();
        let mut journal = Journal::new();
        match (run)(&mut journal) {
            TExit::Succeed(value) => {
                if journal.commit(true) {
                    Expr::Succeed(value)
                } else {
                    attempt::<A, E>(run).into_expr()
                }
            }
            TExit::Fail(error) => {
                if journal.commit(false) {
                    Expr::FailCause(DynCause::fail(error))
                } else {
                    attempt::<A, E>(run).into_expr()
                }
            }
            TExit::Die(defect) => {
                if journal.commit(false) {
                    Expr::FailCause(DynCause::die(defect))
                } else {
                    attempt::<A, E>(run).into_expr()
                }
            }
            TExit::Interrupt(by) => {
                if journal.commit(false) {
                    let by = match by {
                        FiberId::None => me,
                        other => other,
                    };
                    Expr::FailCause(DynCause::interrupt(by))
                } else {
                    attempt::<A, E>(run).into_expr()
                }
            }
            TExit::Retry => {
                if !journal.commit(false) {
                    return attempt::<A, E>(run).into_expr();
                }
                let reads = journal.reads();
                Expr::Async(Box::new(move |handle| {
                    let txn = NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed);
                    let next = {
                        let run = Arc::clone(&run);
                        Box::new(move || attempt::<A, E>(Arc::clone(&run)).into_expr())
                    };
                    let waiter: Arc<dyn Waiter> = Arc::new(RetryWaiter {
                        handle: handle.clone(),
                        next,
                    });
                    // Registration revalidates under each ref's lock: a
                    // commit that landed after our attempt read would
                    // otherwise be a lost wakeup.
                    let mut stale = false;
                    for (slot, expected) in &reads {
                        let mut cell = slot.state.lock();
                        if cell.version != *expected {
                            stale = true;
                            break;
                        }
                        cell.todos.retain(|_, w| !w.fired());
                        cell.todos.insert(txn, Arc::clone(&waiter));
                    }
                    if stale {
                        waiter.wake();
                    }
                    let registered: Vec<Arc<TRefInner>> =
                        reads.iter().map(|(slot, _)| Arc::clone(slot)).collect();
                    Some(Expr::Sync(Box::new(move || {
                        for slot in &registered {
                            slot.state.lock().todos.remove(&txn);
                        }
                        erase(())
                    })))
                }))
            }
        }
    })))
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
    fn commit_applies_writes() {
        let rt = runtime();
        let counter = TRef::new(0_i64);
        let bump = counter.clone();
        let read = counter.clone();
        let exit = rt.run(
            bump.update(|n| n + 1)
                .commit()
                .flat_map(move |()| read.get()),
        );
        assert_eq!(exit, Exit::Success(1));
    }

    #[test]
    fn failed_transaction_leaves_no_writes() {
        let rt = runtime();
        let cell = TRef::new(0_i64);
        let writer = cell.clone();
        let reader = cell.clone();
        let tx: Stm<(), String> = writer
            .write(42)
            .widen_error::<String>()
            .flat_map(|()| Stm::fail("rolled back".to_string()));
        let exit = rt.run(
            tx.commit()
                .fold(|()| None, Some)
                .flat_map(move |seen| reader.get().map(move |n| (seen, n))),
        );
        assert_eq!(
            exit,
            Exit::Success((Some("rolled back".to_string()), 0))
        );
    }

    #[test]
    fn or_else_backtracks_left_writes() {
        let rt = runtime();
        let cell = TRef::new(1_i64);
        let left_cell = cell.clone();
        let right_cell = cell.clone();
        let tx: Stm<i64, String> = left_cell
            .write(99)
            .widen_error::<String>()
            .flat_map(|()| Stm::fail("nope".to_string()))
            .or_else(right_cell.read().widen_error::<String>());
        let exit = rt.run(tx.commit());
        // The right side must not observe the abandoned write.
        assert_eq!(exit, Exit::Success(1));
    }

    #[test]
    fn retry_suspends_until_a_ref_changes() {
        let rt = runtime();
        let gate = TRef::new(0_i32);
        let watched = gate.clone();
        let setter = gate.clone();
        let wait = watched
            .read()
            .flat_map(|n| if n >= 3 { Stm::succeed(n) } else { Stm::retry() })
            .commit();
        let exit = rt.run(wait.fork().flat_map(move |fiber| {
            setter.set(3).flat_map(move |()| fiber.join())
        }));
        assert_eq!(exit, Exit::Success(3));
    }
}
