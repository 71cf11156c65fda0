//! Dynamically-scoped, per-fiber state with explicit fork/join semantics.
//!
//! A [`FiberRef`] is read and written only by the fiber that owns the
//! current value (single-writer), but its value propagates across fork and
//! join: a child starts with the [`fork`] patch applied, and when a child is
//! joined, the difference the child made (`diff` against the nearest common
//! ancestor value) is re-applied to the parent's current value via `patch`
//! rather than blindly overwriting it.
//!
//! A plain [`FiberRef::new`] uses last-write semantics (the patch type *is*
//! the value); refs like the environment or supervisor supply a real patch
//! algebra through [`FiberRef::with_patch`].
//!
//! [`fork`]: FiberRef::with_patch

use crate::effect::value::{erase, unerase, unerase_ref, AnyValue, Data, Never};
use crate::effect::{Effect, Expr};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Process-wide fiber-ref id counter; monotonically increasing, never reset.
static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

/// Type-erased fiber-ref definition: identity, initial value, and the patch
/// algebra operating on erased values.
pub(crate) struct ErasedFiberRef {
    pub(crate) id: u64,
    pub(crate) initial: AnyValue,
    /// `diff(old, new) -> patch`
    pub(crate) diff: Box<dyn Fn(&AnyValue, &AnyValue) -> AnyValue + Send + Sync>,
    /// `combine(first, second) -> patch`
    #[allow(clippy::type_complexity)]
    pub(crate) combine: Box<dyn Fn(&AnyValue, &AnyValue) -> AnyValue + Send + Sync>,
    /// `patch(patch, old) -> new`
    pub(crate) patch: Box<dyn Fn(&AnyValue, &AnyValue) -> AnyValue + Send + Sync>,
    /// Patch applied to seed a child's value on fork; `None` means the child
    /// inherits the parent's value unchanged.
    pub(crate) fork: Option<AnyValue>,
    /// `join(parent, patched) -> new parent value`
    pub(crate) join: Box<dyn Fn(&AnyValue, &AnyValue) -> AnyValue + Send + Sync>,
}

impl std::fmt::Debug for ErasedFiberRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasedFiberRef").field("id", &self.id).finish()
    }
}

/// Per-fiber contextual state with custom fork/join reconciliation.
pub struct FiberRef<V, P = V> {
    pub(crate) erased: Arc<ErasedFiberRef>,
    _marker: PhantomData<fn() -> (V, P)>,
}

impl<V, P> Clone for FiberRef<V, P> {
    fn clone(&self) -> Self {
        Self {
            erased: Arc::clone(&self.erased),
            _marker: PhantomData,
        }
    }
}

impl<V: Data> FiberRef<V, V> {
    /// Creates a ref with last-write semantics: the patch is simply the new
    /// value, children inherit the parent's value, and joins take the
    /// child's value.
    #[must_use]
    pub fn new(initial: V) -> Self {
        Self::with_patch(
            initial,
            None,
            |_old: &V, new: &V| new.clone(),
            |_first: &V, second: &V| second.clone(),
            |patch: &V, _old: &V| patch.clone(),
        )
    }

    /// Creates a ref whose value resets to `reset_to` in every forked child
    /// (the log-span pattern), while joins still reconcile by last write.
    #[must_use]
    pub fn new_fork_reset(initial: V, reset_to: V) -> Self {
        Self::with_patch(
            initial,
            Some(reset_to),
            |_old: &V, new: &V| new.clone(),
            |_first: &V, second: &V| second.clone(),
            |patch: &V, _old: &V| patch.clone(),
        )
    }
}

impl<V: Data, P: Data> FiberRef<V, P> {
    /// Creates a ref with an explicit patch algebra.
    ///
    /// `fork` is the patch applied to seed a child's value (or `None` for
    /// plain inheritance); `diff`, `combine`, and `patch` must satisfy
    /// `patch(diff(a, b), a) == b` and associativity of `combine`.
    #[must_use]
    pub fn with_patch(
        initial: V,
        fork: Option<P>,
        diff: impl Fn(&V, &V) -> P + Send + Sync + 'static,
        combine: impl Fn(&P, &P) -> P + Send + Sync + 'static,
        patch: impl Fn(&P, &V) -> V + Send + Sync + 'static,
    ) -> Self {
        Self::with_patch_and_join(initial, fork, diff, combine, patch, |_old: &V, new: &V| {
            new.clone()
        })
    }

    /// [`with_patch`](Self::with_patch) plus a custom `join(parent, patched)`
    /// step applied after patching on join.
    #[must_use]
    pub fn with_patch_and_join(
        initial: V,
        fork: Option<P>,
        diff: impl Fn(&V, &V) -> P + Send + Sync + 'static,
        combine: impl Fn(&P, &P) -> P + Send + Sync + 'static,
        patch: impl Fn(&P, &V) -> V + Send + Sync + 'static,
        join: impl Fn(&V, &V) -> V + Send + Sync + 'static,
    ) -> Self {
        let erased = ErasedFiberRef {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            initial: erase(initial),
            diff: Box::new(move |old, new| {
                erase(diff(&unerase_ref::<V>(old), &unerase_ref::<V>(new)))
            }),
            combine: Box::new(move |first, second| {
                erase(combine(&unerase_ref::<P>(first), &unerase_ref::<P>(second)))
            }),
            patch: Box::new(move |p, old| {
                erase(patch(&unerase_ref::<P>(p), &unerase_ref::<V>(old)))
            }),
            fork: fork.map(erase),
            join: Box::new(move |old, new| {
                erase(join(&unerase_ref::<V>(old), &unerase_ref::<V>(new)))
            }),
        };
        Self {
            erased: Arc::new(erased),
            _marker: PhantomData,
        }
    }

    /// Reads the current fiber's value.
    #[must_use]
    pub fn get(&self) -> Effect<V, Never> {
        Effect::from_expr(Expr::GetRef(Arc::clone(&self.erased)))
    }

    /// Replaces the current fiber's value.
    #[must_use]
    pub fn set(&self, value: V) -> Effect<(), Never> {
        Effect::from_expr(Expr::SetRef(Arc::clone(&self.erased), erase(value)))
    }

    /// Updates the current fiber's value in one step.
    #[must_use]
    pub fn update(&self, f: impl FnOnce(V) -> V + Send + 'static) -> Effect<(), Never> {
        self.modify(move |v| ((), f(v)))
    }

    /// Computes a result and a new value from the current value, in one
    /// step. Single-writer: atomic with respect to the owning fiber only.
    #[must_use]
    pub fn modify<B: Data>(
        &self,
        f: impl FnOnce(V) -> (B, V) + Send + 'static,
    ) -> Effect<B, Never> {
        let erased = Arc::clone(&self.erased);
        Effect::from_expr(Expr::Stateful(Box::new(move |rt| {
            let current = unerase::<V>(rt.fiber_refs.get(&erased));
            let (out, next) = f(current);
            let owner = rt.id().clone();
            rt.fiber_refs.set(&owner, &erased, erase(next));
            Expr::Succeed(erase(out))
        })))
    }

    /// Runs `effect` with the ref set to `value`, restoring the previous
    /// value afterwards (even on failure or interruption).
    #[must_use]
    pub fn locally<A: Data, E: Data>(&self, value: V, effect: Effect<A, E>) -> Effect<A, E> {
        let this = self.clone();
        let reset = self.clone();
        self.get().widen_error::<E>().flat_map(move |old| {
            this.set(value)
                .widen_error::<E>()
                .flat_map(move |()| effect.ensuring(reset.set(old)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = FiberRef::new(0_u32);
        let b = FiberRef::new(0_u32);
        assert_ne!(a.erased.id, b.erased.id);
    }

    #[test]
    fn erased_algebra_round_trips() {
        // diff/patch round trip through the erased closures.
        let r = FiberRef::with_patch(
            10_i64,
            None,
            |old: &i64, new: &i64| new - old,
            |a: &i64, b: &i64| a + b,
            |p: &i64, old: &i64| old + p,
        );
        let old = erase(10_i64);
        let new = erase(17_i64);
        let patch = (r.erased.diff)(&old, &new);
        let patched = (r.erased.patch)(&patch, &old);
        assert_eq!(unerase::<i64>(patched), 17);
    }

    #[test]
    fn fork_reset_carries_reset_patch() {
        let r = FiberRef::new_fork_reset(vec![1_u8], Vec::new());
        let forked = r.erased.fork.as_ref().map(unerase_ref::<Vec<u8>>);
        assert_eq!(forked, Some(Vec::new()));
    }
}
