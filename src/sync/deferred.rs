//! A set-once value handed from one fiber to any number of waiters.

use crate::cause::{Cause, Defect};
use crate::effect::value::{Data, Never};
use crate::effect::{AsyncCallback, Effect, Expr};
use crate::exit::Exit;
use parking_lot::Mutex;
use slab::Slab;
use std::marker::PhantomData;
use std::sync::Arc;

enum State<A, E> {
    Pending(Slab<AsyncCallback<A, E>>),
    Done(Exit<A, E>),
}

/// A promise completed exactly once.
///
/// Waiters suspend until some fiber completes the deferred; completion is
/// first-write-wins and every later attempt reports `false`. A waiter that
/// is interrupted deregisters itself and never observes a value.
pub struct Deferred<A, E = Never> {
    state: Arc<Mutex<State<A, E>>>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Deferred<A, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            _marker: PhantomData,
        }
    }
}

impl<A, E> std::fmt::Debug for Deferred<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let done = matches!(&*self.state.lock(), State::Done(_));
        f.debug_struct("Deferred").field("done", &done).finish()
    }
}

impl<A: Data, E: Data> Default for Deferred<A, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Data, E: Data> Deferred<A, E> {
    /// Creates an empty deferred as an effect.
    #[must_use]
    pub fn make() -> Effect<Deferred<A, E>, Never> {
        Effect::sync(Deferred::new)
    }

    /// Creates an empty deferred directly.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending(Slab::new()))),
            _marker: PhantomData,
        }
    }

    /// Suspends until the deferred is completed, then succeeds or fails
    /// with the completing exit.
    #[must_use]
    pub fn wait(&self) -> Effect<A, E> {
        let state = Arc::clone(&self.state);
        Effect::async_(move |callback| {
            let key = {
                let mut guard = state.lock();
                match &mut *guard {
                    State::Done(exit) => {
                        let exit = exit.clone();
                        drop(guard);
                        callback.complete(exit);
                        return None;
                    }
                    State::Pending(waiters) => waiters.insert(callback),
                }
            };
            let deregister = Arc::clone(&state);
            Some(Effect::sync(move || {
                if let State::Pending(waiters) = &mut *deregister.lock() {
                    if waiters.contains(key) {
                        waiters.remove(key);
                    }
                }
            }))
        })
    }

    /// Completes with a success value.
    #[must_use]
    pub fn succeed(&self, value: A) -> Effect<bool, Never> {
        self.done(Exit::succeed(value))
    }

    /// Completes with a typed failure.
    #[must_use]
    pub fn fail(&self, error: E) -> Effect<bool, Never> {
        self.done(Exit::fail(error))
    }

    /// Completes with a full cause.
    #[must_use]
    pub fn fail_cause(&self, cause: Cause<E>) -> Effect<bool, Never> {
        self.done(Exit::fail_cause(cause))
    }

    /// Completes with a defect.
    #[must_use]
    pub fn die(&self, defect: Defect) -> Effect<bool, Never> {
        self.done(Exit::die(defect))
    }

    /// Completes with interruption attributed to the calling fiber.
    #[must_use]
    pub fn interrupt(&self) -> Effect<bool, Never> {
        let this = self.clone();
        Effect::from_expr(Expr::Stateful(Box::new(move |rt| {
            this.done(Exit::interrupt(rt.id().clone())).into_expr()
        })))
    }

    /// Completes with an arbitrary exit. Returns whether this call won;
    /// `false` means the deferred was already completed and nothing
    /// changed.
    #[must_use]
    pub fn done(&self, exit: Exit<A, E>) -> Effect<bool, Never> {
        let state = Arc::clone(&self.state);
        Effect::sync(move || {
            let waiters = {
                let mut guard = state.lock();
                match &mut *guard {
                    State::Done(_) => return false,
                    State::Pending(waiters) => {
                        let waiters = std::mem::take(waiters);
                        *guard = State::Done(exit.clone());
                        waiters
                    }
                }
            };
            for (_, waiter) in waiters {
                waiter.complete(exit.clone());
            }
            true
        })
    }

    /// The completing exit, if any, without suspending.
    #[must_use]
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>, Never> {
        let state = Arc::clone(&self.state);
        Effect::sync(move || match &*state.lock() {
            State::Done(exit) => Some(exit.clone()),
            State::Pending(_) => None,
        })
    }

    /// Whether the deferred has been completed.
    #[must_use]
    pub fn is_done(&self) -> Effect<bool, Never> {
        let state = Arc::clone(&self.state);
        Effect::sync(move || matches!(&*state.lock(), State::Done(_)))
    }
}
