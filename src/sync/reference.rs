//! A mutable cell shared between fibers.

use crate::effect::value::{Data, Never};
use crate::effect::Effect;
use parking_lot::Mutex;
use std::sync::Arc;

/// A shared mutable cell whose operations are effects.
///
/// Every operation takes the cell's lock for the duration of one read,
/// update, or swap, so a [`modify`](Ref::modify) is atomic with respect to
/// every other fiber touching the same ref. The update functions run under
/// the lock and must not perform effects of their own.
pub struct Ref<A> {
    state: Arc<Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<A> std::fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ref").finish_non_exhaustive()
    }
}

impl<A: Data> Ref<A> {
    /// Creates a ref as an effect.
    #[must_use]
    pub fn make(initial: A) -> Effect<Ref<A>, Never> {
        Effect::sync(move || Ref::new(initial))
    }

    /// Creates a ref directly.
    #[must_use]
    pub fn new(initial: A) -> Self {
        Self {
            state: Arc::new(Mutex::new(initial)),
        }
    }

    /// Reads the current value.
    #[must_use]
    pub fn get(&self) -> Effect<A, Never> {
        let state = Arc::clone(&self.state);
        Effect::sync(move || state.lock().clone())
    }

    /// Replaces the value.
    #[must_use]
    pub fn set(&self, value: A) -> Effect<(), Never> {
        let state = Arc::clone(&self.state);
        Effect::sync(move || {
            *state.lock() = value;
        })
    }

    /// Replaces the value, returning the previous one.
    #[must_use]
    pub fn get_and_set(&self, value: A) -> Effect<A, Never> {
        self.modify(move |old| (old, value))
    }

    /// Atomically transforms the value.
    #[must_use]
    pub fn update(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Effect<(), Never> {
        self.modify(move |old| ((), f(old)))
    }

    /// Atomically transforms the value, returning the new one.
    #[must_use]
    pub fn update_and_get(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Effect<A, Never> {
        self.modify(move |old| {
            let new = f(old);
            (new.clone(), new)
        })
    }

    /// Atomically computes a result and a replacement value in one step.
    #[must_use]
    pub fn modify<B: Data>(
        &self,
        f: impl FnOnce(A) -> (B, A) + Send + 'static,
    ) -> Effect<B, Never> {
        let state = Arc::clone(&self.state);
        Effect::sync(move || {
            let mut guard = state.lock();
            let (out, next) = f(guard.clone());
            *guard = next;
            out
        })
    }
}
