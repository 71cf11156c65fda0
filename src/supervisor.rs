//! Supervision: observing fiber lifecycles.
//!
//! A [`Supervisor`] is an immutable tree of [`Supervise`] hooks carried in a
//! fiber ref, so supervision installed for a region propagates to forked
//! children and reconciles on join through [`SupervisorPatch`], a
//! set-difference patch over the tree's leaves keyed on identity.
//!
//! Composition forms: `zip` runs both sides' hooks and pairs their values;
//! `const_value` observes nothing but exposes a fixed value; `proxy`
//! delegates to a swappable target. Hooks fire on the forking fiber's worker
//! (`on_start`) and the ending fiber's worker (`on_end`); they must be cheap
//! and must not block.

use crate::effect::value::AnyValue;
use crate::exit::Exit;
use crate::fiber::FiberId;
use parking_lot::Mutex;
use std::sync::Arc;

/// Lifecycle hooks for fibers forked while this supervisor is current.
pub trait Supervise: Send + Sync {
    /// A child fiber was forked.
    fn on_start(&self, parent: &FiberId, child: &FiberId) {
        let _ = (parent, child);
    }

    /// A supervised fiber ended with the given exit.
    fn on_end(&self, fiber: &FiberId, exit: &Exit<AnyValue, AnyValue>) {
        let _ = (fiber, exit);
    }

    /// The hook's observable value (e.g. the set of tracked fibers).
    fn value(&self) -> AnyValue {
        Arc::new(())
    }
}

#[derive(Clone)]
enum Inner {
    None,
    Hook(Arc<dyn Supervise>),
    Const(AnyValue),
    Zip(Arc<(Supervisor, Supervisor)>),
    Proxy(Arc<Mutex<Supervisor>>),
}

/// An immutable, composable collection of supervision hooks.
#[derive(Clone)]
pub struct Supervisor {
    inner: Inner,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::none()
    }
}

impl Supervisor {
    /// The supervisor that observes nothing.
    #[must_use]
    pub fn none() -> Self {
        Self { inner: Inner::None }
    }

    /// A supervisor running a single hook.
    #[must_use]
    pub fn new(hook: impl Supervise + 'static) -> Self {
        Self::from_hook(Arc::new(hook))
    }

    /// A supervisor running an already-shared hook.
    #[must_use]
    pub fn from_hook(hook: Arc<dyn Supervise>) -> Self {
        Self {
            inner: Inner::Hook(hook),
        }
    }

    /// A supervisor with no hooks that exposes a fixed value.
    #[must_use]
    pub fn const_value(value: AnyValue) -> Self {
        Self {
            inner: Inner::Const(value),
        }
    }

    /// A supervisor delegating to a swappable target; the handle swaps it.
    #[must_use]
    pub fn proxy(initial: Supervisor) -> (Self, ProxyHandle) {
        let target = Arc::new(Mutex::new(initial));
        (
            Self {
                inner: Inner::Proxy(Arc::clone(&target)),
            },
            ProxyHandle { target },
        )
    }

    /// Combines two supervisors; both sides' hooks fire and the value is
    /// the pair of both values.
    #[must_use]
    pub fn zip(&self, that: &Supervisor) -> Self {
        Self {
            inner: Inner::Zip(Arc::new((self.clone(), that.clone()))),
        }
    }

    /// The supervisor's observable value.
    #[must_use]
    pub fn value(&self) -> AnyValue {
        match &self.inner {
            Inner::None => Arc::new(()),
            Inner::Hook(hook) => hook.value(),
            Inner::Const(value) => Arc::clone(value),
            Inner::Zip(pair) => Arc::new((pair.0.value(), pair.1.value())),
            Inner::Proxy(target) => target.lock().value(),
        }
    }

    /// Whether any hook or value is installed.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self.inner, Inner::None)
    }

    pub(crate) fn on_start(&self, parent: &FiberId, child: &FiberId) {
        match &self.inner {
            Inner::None | Inner::Const(_) => {}
            Inner::Hook(hook) => hook.on_start(parent, child),
            Inner::Zip(pair) => {
                pair.0.on_start(parent, child);
                pair.1.on_start(parent, child);
            }
            Inner::Proxy(target) => {
                let current = target.lock().clone();
                current.on_start(parent, child);
            }
        }
    }

    pub(crate) fn on_end(&self, fiber: &FiberId, exit: &Exit<AnyValue, AnyValue>) {
        match &self.inner {
            Inner::None | Inner::Const(_) => {}
            Inner::Hook(hook) => hook.on_end(fiber, exit),
            Inner::Zip(pair) => {
                pair.0.on_end(fiber, exit);
                pair.1.on_end(fiber, exit);
            }
            Inner::Proxy(target) => {
                let current = target.lock().clone();
                current.on_end(fiber, exit);
            }
        }
    }

    /// The leaf supervisors, left-to-right; `none` contributes nothing.
    fn leaves(&self) -> Vec<Supervisor> {
        match &self.inner {
            Inner::None => Vec::new(),
            Inner::Zip(pair) => {
                let mut out = pair.0.leaves();
                out.extend(pair.1.leaves());
                out
            }
            _ => vec![self.clone()],
        }
    }

    fn leaf_eq(a: &Supervisor, b: &Supervisor) -> bool {
        match (&a.inner, &b.inner) {
            (Inner::Hook(x), Inner::Hook(y)) => Arc::ptr_eq(x, y),
            (Inner::Const(x), Inner::Const(y)) => Arc::ptr_eq(x, y),
            (Inner::Proxy(x), Inner::Proxy(y)) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }

    /// Leaf identity equality, used by tests and the patch algebra.
    #[must_use]
    pub fn same_supervisors(&self, that: &Supervisor) -> bool {
        let mine = self.leaves();
        let theirs = that.leaves();
        mine.len() == theirs.len()
            && mine
                .iter()
                .all(|l| theirs.iter().any(|r| Self::leaf_eq(l, r)))
    }

    /// The patch turning `old` into `new`, by leaf identity.
    #[must_use]
    pub fn diff(old: &Supervisor, new: &Supervisor) -> SupervisorPatch {
        let old_leaves = old.leaves();
        let new_leaves = new.leaves();
        let mut patch = SupervisorPatch::Empty;
        for leaf in &new_leaves {
            if !old_leaves.iter().any(|o| Self::leaf_eq(o, leaf)) {
                patch = patch.and_then(&SupervisorPatch::AddSupervisor(leaf.clone()));
            }
        }
        for leaf in &old_leaves {
            if !new_leaves.iter().any(|n| Self::leaf_eq(n, leaf)) {
                patch = patch.and_then(&SupervisorPatch::RemoveSupervisor(leaf.clone()));
            }
        }
        patch
    }

    fn from_leaves(leaves: Vec<Supervisor>) -> Supervisor {
        leaves
            .into_iter()
            .reduce(|acc, next| acc.zip(&next))
            .unwrap_or_else(Supervisor::none)
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            Inner::None => "None",
            Inner::Hook(_) => "Hook",
            Inner::Const(_) => "Const",
            Inner::Zip(_) => "Zip",
            Inner::Proxy(_) => "Proxy",
        };
        f.debug_struct("Supervisor").field("kind", &kind).finish()
    }
}

/// Swaps the target of a proxy supervisor.
#[derive(Clone)]
pub struct ProxyHandle {
    target: Arc<Mutex<Supervisor>>,
}

impl ProxyHandle {
    pub fn set(&self, supervisor: Supervisor) {
        *self.target.lock() = supervisor;
    }
}

/// A change between two supervisors.
#[derive(Clone, Default)]
pub enum SupervisorPatch {
    /// No change.
    #[default]
    Empty,
    /// Add one leaf supervisor.
    AddSupervisor(Supervisor),
    /// Remove one leaf supervisor (by identity).
    RemoveSupervisor(Supervisor),
    /// Apply the first patch, then the second.
    Combine(Box<SupervisorPatch>, Box<SupervisorPatch>),
}

impl SupervisorPatch {
    /// Whether the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Combine(l, r) => l.is_empty() && r.is_empty(),
            _ => false,
        }
    }

    /// Sequential composition, dropping `Empty` operands.
    #[must_use]
    pub fn and_then(&self, that: &SupervisorPatch) -> Self {
        match (self, that) {
            (Self::Empty, p) | (p, Self::Empty) => p.clone(),
            (l, r) => Self::Combine(Box::new(l.clone()), Box::new(r.clone())),
        }
    }

    /// Applies the patch to a supervisor.
    #[must_use]
    pub fn apply(&self, supervisor: &Supervisor) -> Supervisor {
        match self {
            Self::Empty => supervisor.clone(),
            Self::Combine(l, r) => r.apply(&l.apply(supervisor)),
            Self::AddSupervisor(leaf) => {
                let mut leaves = supervisor.leaves();
                if !leaves.iter().any(|l| Supervisor::leaf_eq(l, leaf)) {
                    leaves.push(leaf.clone());
                }
                Supervisor::from_leaves(leaves)
            }
            Self::RemoveSupervisor(leaf) => {
                let mut leaves = supervisor.leaves();
                leaves.retain(|l| !Supervisor::leaf_eq(l, leaf));
                Supervisor::from_leaves(leaves)
            }
        }
    }
}

impl std::fmt::Debug for SupervisorPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::AddSupervisor(_) => f.write_str("Add"),
            Self::RemoveSupervisor(_) => f.write_str("Remove"),
            Self::Combine(l, r) => write!(f, "({l:?}; {r:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        started: Mutex<Vec<FiberId>>,
    }

    impl Supervise for Recorder {
        fn on_start(&self, _parent: &FiberId, child: &FiberId) {
            self.started.lock().push(child.clone());
        }
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder {
            started: Mutex::new(Vec::new()),
        })
    }

    fn fid(seq: u64) -> FiberId {
        FiberId::Gen {
            seq,
            started_at: crate::services::clock::Timestamp::ZERO,
        }
    }

    #[test]
    fn zip_fires_both_hooks() {
        let a = recorder();
        let b = recorder();
        let sup = Supervisor::from_hook(a.clone()).zip(&Supervisor::from_hook(b.clone()));
        sup.on_start(&fid(1), &fid(2));
        assert_eq!(a.started.lock().len(), 1);
        assert_eq!(b.started.lock().len(), 1);
    }

    #[test]
    fn const_exposes_value() {
        let sup = Supervisor::const_value(Arc::new(7_u32));
        let value = sup.value();
        assert_eq!(value.downcast_ref::<u32>(), Some(&7));
    }

    #[test]
    fn proxy_delegates_to_current_target() {
        let a = recorder();
        let (sup, handle) = Supervisor::proxy(Supervisor::none());
        sup.on_start(&fid(1), &fid(2));
        assert_eq!(a.started.lock().len(), 0);
        handle.set(Supervisor::from_hook(a.clone()));
        sup.on_start(&fid(1), &fid(3));
        assert_eq!(a.started.lock().len(), 1);
    }

    #[test]
    fn diff_apply_round_trips() {
        let old = Supervisor::from_hook(recorder());
        let new = old.zip(&Supervisor::from_hook(recorder()));
        let patch = Supervisor::diff(&old, &new);
        assert!(patch.apply(&old).same_supervisors(&new));
        assert!(Supervisor::diff(&old, &old).is_empty());
    }

    #[test]
    fn remove_patch_drops_only_named_leaf() {
        let keep = Supervisor::from_hook(recorder());
        let drop = Supervisor::from_hook(recorder());
        let both = keep.zip(&drop);
        let patch = Supervisor::diff(&both, &keep);
        assert!(patch.apply(&both).same_supervisors(&keep));
    }
}
