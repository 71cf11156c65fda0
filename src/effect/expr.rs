//! The untyped effect description tree.
//!
//! An [`Expr`] is an immutable description of a computation: pure data until
//! the fiber interpreter walks it. Sequential composition is explicit
//! (`FlatMap`/`FoldCause` push continuation frames onto the fiber's own
//! stack, never the native call stack), so bind chains of any depth are
//! safe, and interruption can land between any two nodes.
//!
//! The public typed [`Effect`](crate::effect::Effect) wrapper is a phantom-
//! typed view over this tree; payloads are erased [`AnyValue`]s.

use crate::cause::DynCause;
use crate::context::fiber_ref::ErasedFiberRef;
use crate::effect::value::AnyValue;
use crate::exit::DynExit;
use crate::fiber::cell::ResumeHandle;
use crate::fiber::flags::FlagsPatch;
use crate::fiber::runtime::FiberRuntime;
use std::sync::Arc;

/// Success continuation: receives the upstream value, yields the next node.
pub(crate) type OnSuccessFn = Box<dyn FnOnce(AnyValue) -> Expr + Send>;

/// Failure continuation: receives the upstream cause, yields the next node.
pub(crate) type OnFailureFn = Box<dyn FnOnce(DynCause) -> Expr + Send>;

/// Finalizer builder: receives the exit being propagated, yields the cleanup
/// effect to run before propagation continues.
pub(crate) type FinalizerFn = Box<dyn FnOnce(&DynExit) -> Expr + Send>;

/// Asynchronous registration: receives the resume handle, returns the
/// canceler effect to run if the fiber is interrupted while suspended.
pub(crate) type RegisterFn = Box<dyn FnOnce(ResumeHandle) -> Option<Expr> + Send>;

/// Stateful step: runs against the fiber's own interpreter state.
pub(crate) type StatefulFn = Box<dyn FnOnce(&mut FiberRuntime) -> Expr + Send>;

/// A node in the effect description tree.
pub(crate) enum Expr {
    /// A pure value.
    Succeed(AnyValue),
    /// A raised failure cause.
    FailCause(DynCause),
    /// A deferred side-effecting thunk producing a value.
    Sync(Box<dyn FnOnce() -> AnyValue + Send>),
    /// A deferred effect construction.
    Suspend(Box<dyn FnOnce() -> Expr + Send>),
    /// Sequential bind.
    FlatMap(Box<Expr>, OnSuccessFn),
    /// Sequential bind with a failure branch (error recovery).
    FoldCause(Box<Expr>, OnSuccessFn, OnFailureFn),
    /// Callback-based asynchronous suspension.
    Async(RegisterFn),
    /// Fork the child description into a new fiber attached to the current
    /// fiber's scope; completes with the child's cell handle.
    Fork(Box<Expr>),
    /// Run both sides in child fibers; complete with the first terminal
    /// exit and interrupt the loser under a composite fiber id.
    Race(Box<Expr>, Box<Expr>),
    /// Run the body with patched runtime flags, restoring them on exit
    /// (the uninterruptible-region marker).
    FlagsRegion {
        /// Patch applied for the duration of the region.
        patch: FlagsPatch,
        /// The region body.
        body: Box<Expr>,
    },
    /// Read a fiber ref.
    GetRef(Arc<ErasedFiberRef>),
    /// Write a fiber ref.
    SetRef(Arc<ErasedFiberRef>, AnyValue),
    /// Register a finalizer around the body: the finalizer runs exactly
    /// once with the body's exit, before the exit propagates.
    OnExit {
        /// The guarded body.
        body: Box<Expr>,
        /// Builds the cleanup effect from the body's exit.
        finalizer: FinalizerFn,
    },
    /// Synchronous step against the fiber's interpreter state.
    Stateful(StatefulFn),
    /// Voluntarily yield to other fibers.
    YieldNow,
}

impl Expr {
    /// Unit value node.
    pub(crate) fn unit() -> Expr {
        Expr::Succeed(Arc::new(()))
    }

    /// The node's tag, used for stack traces and tracing.
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Expr::Succeed(_) => "Succeed",
            Expr::FailCause(_) => "FailCause",
            Expr::Sync(_) => "Sync",
            Expr::Suspend(_) => "Suspend",
            Expr::FlatMap(..) => "FlatMap",
            Expr::FoldCause(..) => "FoldCause",
            Expr::Async(_) => "Async",
            Expr::Fork(_) => "Fork",
            Expr::Race(..) => "Race",
            Expr::FlagsRegion { .. } => "FlagsRegion",
            Expr::GetRef(_) => "GetRef",
            Expr::SetRef(..) => "SetRef",
            Expr::OnExit { .. } => "OnExit",
            Expr::Stateful(_) => "Stateful",
            Expr::YieldNow => "YieldNow",
        }
    }

    /// The node resuming with `exit`: its value on success, its cause on
    /// failure.
    pub(crate) fn from_exit(exit: DynExit) -> Expr {
        match exit {
            DynExit::Success(v) => Expr::Succeed(v),
            DynExit::Failure(c) => Expr::FailCause(c),
        }
    }
}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}
