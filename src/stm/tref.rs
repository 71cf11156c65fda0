//! Transactional references.

use crate::effect::value::{erase, unerase, AnyValue, Data, Never};
use crate::effect::Effect;
use crate::stm::{Stm, TExit};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TREF_ID: AtomicU64 = AtomicU64::new(1);

/// A parked transaction waiting for some ref it read to change.
pub(crate) trait Waiter: Send + Sync {
    /// Whether the transaction has already been woken through another ref.
    fn fired(&self) -> bool;
    /// Re-runs the transaction on its suspended fiber. Idempotent.
    fn wake(&self);
}

/// A ref's live state: the committed value, its version, and the retrying
/// transactions to wake when the version moves.
pub(crate) struct VersionedCell {
    pub(crate) value: AnyValue,
    pub(crate) version: u64,
    pub(crate) todos: HashMap<u64, Arc<dyn Waiter>>,
}

pub(crate) struct TRefInner {
    /// Global id; journals lock refs in id order so commits cannot
    /// deadlock.
    pub(crate) id: u64,
    pub(crate) state: Mutex<VersionedCell>,
}

/// A mutable cell readable and writable only inside a transaction.
pub struct TRef<A> {
    pub(crate) inner: Arc<TRefInner>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for TRef<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<A> std::fmt::Debug for TRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TRef").field("id", &self.inner.id).finish()
    }
}

impl<A: Data> TRef<A> {
    /// Creates a ref directly.
    #[must_use]
    pub fn new(initial: A) -> Self {
        Self {
            inner: Arc::new(TRefInner {
                id: NEXT_TREF_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(VersionedCell {
                    value: erase(initial),
                    version: 0,
                    todos: HashMap::new(),
                }),
            }),
            _marker: PhantomData,
        }
    }

    /// Creates a ref as an effect.
    #[must_use]
    pub fn make(initial: A) -> Effect<TRef<A>, Never> {
        Effect::sync(move || TRef::new(initial))
    }

    /// Reads the ref inside the current transaction.
    #[must_use]
    pub fn read(&self) -> Stm<A, Never> {
        let inner = Arc::clone(&self.inner);
        Stm::from_run(move |journal| TExit::Succeed(journal.read(&inner)))
    }

    /// Writes the ref inside the current transaction.
    #[must_use]
    pub fn write(&self, value: A) -> Stm<(), Never> {
        let inner = Arc::clone(&self.inner);
        let value = erase(value);
        Stm::from_run(move |journal| {
            journal.write(&inner, value.clone());
            TExit::Succeed(erase(()))
        })
    }

    /// Transforms the value inside the current transaction.
    #[must_use]
    pub fn update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<(), Never> {
        self.modify(move |a| ((), f(a)))
    }

    /// Transforms the value and returns the new one.
    #[must_use]
    pub fn update_and_get(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<A, Never> {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    /// Replaces the value and returns the previous one.
    #[must_use]
    pub fn get_and_set(&self, value: A) -> Stm<A, Never> {
        self.modify(move |old| (old, value.clone()))
    }

    /// Computes a result and a replacement value in one transactional step.
    #[must_use]
    pub fn modify<B: Data>(
        &self,
        f: impl Fn(A) -> (B, A) + Send + Sync + 'static,
    ) -> Stm<B, Never> {
        let inner = Arc::clone(&self.inner);
        Stm::from_run(move |journal| {
            let current = unerase::<A>(journal.read(&inner));
            let (out, next) = f(current);
            journal.write(&inner, erase(next));
            TExit::Succeed(erase(out))
        })
    }

    /// The committed value, outside any transaction.
    #[must_use]
    pub fn get(&self) -> Effect<A, Never> {
        self.read().commit()
    }

    /// Replaces the committed value, outside any transaction.
    #[must_use]
    pub fn set(&self, value: A) -> Effect<(), Never> {
        self.write(value).commit()
    }
}
