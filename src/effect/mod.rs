//! The typed effect surface.
//!
//! An [`Effect<A, E>`] is an immutable description of a computation that,
//! when run by a fiber, either succeeds with an `A` or fails with a
//! [`Cause<E>`]. Building an effect does nothing; only a
//! [`Runtime`](crate::runtime::Runtime) (or a forked fiber) executes it.
//!
//! Effects are `FnOnce` at heart: the description tree owns its closures and
//! is consumed by execution, so a value to be run repeatedly is expressed as
//! a factory (`Fn() -> Effect<..>`), as [`forever`] and the schedule-driven
//! combinators do.

pub(crate) mod expr;
pub mod value;

use crate::cause::{Cause, Defect, DynCause};
use crate::context::environment::{Environment, ServiceNotFound};
use crate::exit::Exit;
use crate::fiber::cell::FiberCell;
use crate::fiber::flags::{FlagsPatch, RuntimeFlags};
use crate::fiber::Fiber;
use crate::services::clock::ClockService;
use core::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

pub(crate) use expr::Expr;
pub use value::{AnyValue, Data, Never};

use value::{erase, unerase};

/// Restores a typed cause from its erased form.
pub(crate) fn typed_cause<E: Data>(cause: DynCause) -> Cause<E> {
    cause.map(unerase::<E>)
}

/// Erases a typed cause.
pub(crate) fn erased_cause<E: Data>(cause: Cause<E>) -> DynCause {
    cause.map(erase)
}

/// A lazy, composable description of a computation.
///
/// `A` is the success type, `E` the typed failure type (defaulting to
/// [`Never`] for effects that cannot fail). Defects and interruption travel
/// outside `E`, in the [`Cause`] channel.
#[must_use = "effects do nothing until run on a runtime"]
pub struct Effect<A, E = Never> {
    pub(crate) expr: Expr,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Effect").field(&self.expr.tag()).finish()
    }
}

impl<A: Data, E: Data> Effect<A, E> {
    pub(crate) fn from_expr(expr: Expr) -> Self {
        Self {
            expr,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_expr(self) -> Expr {
        self.expr
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// An effect that succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_expr(Expr::Succeed(erase(value)))
    }

    /// An effect that fails with the typed error `error`.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::fail(error))
    }

    /// An effect that fails with a full cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_expr(Expr::FailCause(erased_cause(cause)))
    }

    /// An effect that dies with a defect.
    pub fn die(defect: Defect) -> Self {
        Self::fail_cause(Cause::die(defect))
    }

    /// Lifts a `Result` into an effect.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Self::succeed(a),
            Err(e) => Self::fail(e),
        }
    }

    /// Lifts a terminal exit back into an effect.
    pub fn done(exit: Exit<A, E>) -> Self {
        Self::from_expr(Expr::from_exit(exit.erased()))
    }

    /// A side-effecting computation, run on the fiber when reached.
    ///
    /// A panic inside `f` is caught by the interpreter and becomes a defect.
    pub fn sync(f: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::from_expr(Expr::Sync(Box::new(move || erase(f()))))
    }

    /// Defers construction of the effect itself until it is run.
    pub fn suspend(f: impl FnOnce() -> Effect<A, E> + Send + 'static) -> Self {
        Self::from_expr(Expr::Suspend(Box::new(move || f().expr)))
    }

    /// A callback-based asynchronous effect.
    ///
    /// `register` receives a cloneable, fire-once [`AsyncCallback`] and may
    /// return a canceler effect, run if the fiber is interrupted while
    /// suspended. If the callback fires during registration the fiber never
    /// parks.
    pub fn async_(
        register: impl FnOnce(AsyncCallback<A, E>) -> Option<Effect<(), Never>> + Send + 'static,
    ) -> Self {
        Self::from_expr(Expr::Async(Box::new(move |handle| {
            let callback = AsyncCallback {
                handle,
                _marker: PhantomData,
            };
            register(callback).map(Effect::into_expr)
        })))
    }

    /// An effect that never completes (but can be interrupted).
    pub fn never() -> Self {
        Self::from_expr(Expr::Async(Box::new(|_| None)))
    }

    /// Fails with an interruption cause attributed to the current fiber.
    pub fn interrupt_self() -> Self {
        Self::from_expr(Expr::Stateful(Box::new(|rt| {
            Expr::FailCause(DynCause::interrupt(rt.id().clone()))
        })))
    }

    /// The identity of the fiber running this effect.
    pub fn fiber_id() -> Effect<crate::fiber::FiberId, E> {
        Effect::from_expr(Expr::Stateful(Box::new(|rt| {
            Expr::Succeed(erase(rt.id().clone()))
        })))
    }

    /// Runs `effect` if `cond` holds.
    pub fn when(cond: bool, effect: Effect<A, E>) -> Effect<Option<A>, E> {
        if cond {
            effect.map(Some)
        } else {
            Effect::succeed(None)
        }
    }

    // ------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------

    /// Sequential bind: run `self`, then the effect built from its value.
    pub fn flat_map<B: Data>(
        self,
        f: impl FnOnce(A) -> Effect<B, E> + Send + 'static,
    ) -> Effect<B, E> {
        Effect::from_expr(Expr::FlatMap(
            Box::new(self.expr),
            Box::new(move |v| f(unerase::<A>(v)).expr),
        ))
    }

    /// Maps the success value.
    pub fn map<B: Data>(self, f: impl FnOnce(A) -> B + Send + 'static) -> Effect<B, E> {
        Effect::from_expr(Expr::FlatMap(
            Box::new(self.expr),
            Box::new(move |v| Expr::Succeed(erase(f(unerase::<A>(v))))),
        ))
    }

    /// Replaces the success value with unit.
    pub fn discard(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Sequences `that` after `self`, keeping both values.
    pub fn zip<B: Data>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Sequences `that` after `self`, combining the values with `f`.
    pub fn zip_with<B: Data, C: Data>(
        self,
        that: Effect<B, E>,
        f: impl FnOnce(A, B) -> C + Send + 'static,
    ) -> Effect<C, E> {
        self.flat_map(move |a| that.map(move |b| f(a, b)))
    }

    /// Sequences `that` after `self`, keeping the first value.
    pub fn zip_left<B: Data>(self, that: Effect<B, E>) -> Effect<A, E> {
        self.zip_with(that, |a, _| a)
    }

    /// Sequences `that` after `self`, keeping the second value.
    pub fn zip_right<B: Data>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.zip_with(that, |_, b| b)
    }

    // ------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------

    /// The fundamental fold: continues with `success` on a value and
    /// `failure` on any cause (typed failures, defects, or interruption).
    pub fn fold_cause<B: Data, F: Data>(
        self,
        success: impl FnOnce(A) -> Effect<B, F> + Send + 'static,
        failure: impl FnOnce(Cause<E>) -> Effect<B, F> + Send + 'static,
    ) -> Effect<B, F> {
        Effect::from_expr(Expr::FoldCause(
            Box::new(self.expr),
            Box::new(move |v| success(unerase::<A>(v)).expr),
            Box::new(move |c| failure(typed_cause::<E>(c)).expr),
        ))
    }

    /// Folds over the success value or the first typed failure. Causes with
    /// no typed failure (defects, interruption) propagate unchanged.
    pub fn fold<B: Data>(
        self,
        success: impl FnOnce(A) -> B + Send + 'static,
        failure: impl FnOnce(E) -> B + Send + 'static,
    ) -> Effect<B, Never> {
        self.fold_cause(
            move |a| Effect::succeed(success(a)),
            move |cause| match cause.failure_or_cause() {
                Ok(e) => Effect::succeed(failure(e)),
                Err(rest) => Effect::from_expr(Expr::FailCause(erased_cause(rest))),
            },
        )
    }

    /// Surfaces the typed failure channel in the success value.
    pub fn either(self) -> Effect<Result<A, E>, Never> {
        self.fold(Ok, Err)
    }

    /// Recovers from any typed failure. Causes with no typed failure
    /// propagate unchanged.
    pub fn catch_all<E2: Data>(
        self,
        f: impl FnOnce(E) -> Effect<A, E2> + Send + 'static,
    ) -> Effect<A, E2> {
        Effect::from_expr(Expr::FoldCause(
            Box::new(self.expr),
            Box::new(Expr::Succeed),
            Box::new(move |dyn_cause| {
                match typed_cause::<E>(dyn_cause.clone()).failure_or_cause() {
                    Ok(e) => f(e).expr,
                    Err(_) => Expr::FailCause(dyn_cause),
                }
            }),
        ))
    }

    /// Maps every typed failure, preserving the cause structure.
    pub fn map_error<F: Data>(self, f: impl Fn(E) -> F + Send + 'static) -> Effect<A, F> {
        Effect::from_expr(Expr::FoldCause(
            Box::new(self.expr),
            Box::new(Expr::Succeed),
            Box::new(move |c| Expr::FailCause(c.map(|v| erase(f(unerase::<E>(v)))))),
        ))
    }

    /// Discards the result entirely; failures of every kind are swallowed.
    pub fn ignore(self) -> Effect<(), Never> {
        self.fold_cause(|_| Effect::succeed(()), |_| Effect::succeed(()))
    }

    // ------------------------------------------------------------------
    // Resource safety
    // ------------------------------------------------------------------

    /// Runs `finalizer` when `self` completes, for every kind of exit. The
    /// finalizer runs uninterruptibly before the exit propagates.
    pub fn ensuring(self, finalizer: Effect<(), Never>) -> Self {
        Self::from_expr(Expr::OnExit {
            body: Box::new(self.expr),
            finalizer: Box::new(move |_| finalizer.expr),
        })
    }

    /// Like [`ensuring`](Self::ensuring), but the finalizer sees the exit.
    pub fn on_exit(
        self,
        f: impl FnOnce(&Exit<A, E>) -> Effect<(), Never> + Send + 'static,
    ) -> Self {
        Self::from_expr(Expr::OnExit {
            body: Box::new(self.expr),
            finalizer: Box::new(move |exit| f(&exit.clone().typed::<A, E>()).expr),
        })
    }

    // ------------------------------------------------------------------
    // Interruption
    // ------------------------------------------------------------------

    /// Marks the region interruptible, restoring the previous setting on
    /// exit.
    pub fn interruptible(self) -> Self {
        Self::from_expr(Expr::FlagsRegion {
            patch: FlagsPatch::enable(RuntimeFlags::INTERRUPTION),
            body: Box::new(self.expr),
        })
    }

    /// Marks the region uninterruptible, restoring the previous setting on
    /// exit. A pending interrupt is delivered when the region closes.
    pub fn uninterruptible(self) -> Self {
        Self::from_expr(Expr::FlagsRegion {
            patch: FlagsPatch::disable(RuntimeFlags::INTERRUPTION),
            body: Box::new(self.expr),
        })
    }

    /// Runs `f` uninterruptibly, handing it a mask that can restore the
    /// *outer* interruptibility for chosen sub-effects (the acquire-release
    /// pattern: the acquisition stays masked, the use site is restored).
    pub fn uninterruptible_mask(
        f: impl FnOnce(InterruptMask) -> Effect<A, E> + Send + 'static,
    ) -> Self {
        Self::from_expr(Expr::Stateful(Box::new(move |rt| {
            let mask = InterruptMask {
                was_interruptible: rt.flags().interruption(),
            };
            Expr::FlagsRegion {
                patch: FlagsPatch::disable(RuntimeFlags::INTERRUPTION),
                body: Box::new(f(mask).expr),
            }
        })))
    }

    // ------------------------------------------------------------------
    // Concurrency
    // ------------------------------------------------------------------

    /// Starts this effect on a new fiber, a child of the current fiber's
    /// scope. Forking never fails; the child's exit is observed via the
    /// returned [`Fiber`].
    pub fn fork(self) -> Effect<Fiber<A, E>, Never> {
        Effect::from_expr(Expr::FlatMap(
            Box::new(Expr::Fork(Box::new(self.expr))),
            Box::new(|v| {
                Expr::Succeed(erase(Fiber::<A, E>::from_cell(unerase::<Arc<FiberCell>>(v))))
            }),
        ))
    }

    /// Races two effects: the first to complete wins, the loser is
    /// interrupted. The winner's exit becomes the race's exit, including
    /// failure.
    pub fn race(self, that: Effect<A, E>) -> Effect<A, E> {
        Effect::from_expr(Expr::Race(Box::new(self.expr), Box::new(that.expr)))
    }

    /// Runs both effects on child fibers and waits for both values. If the
    /// left side fails, the right side is interrupted and any non-interrupt
    /// cause it produced is combined in parallel with the left cause.
    pub fn zip_par<B: Data>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.fork().widen_error::<E>().flat_map(move |left| {
            that.fork().widen_error::<E>().flat_map(move |right| {
                let loser = right.clone();
                left.join().fold_cause(
                    move |a| right.join().map(move |b| (a, b)),
                    move |cause| {
                        loser.interrupt().widen_error::<E>().flat_map(move |exit| {
                            let cause = match exit {
                                Exit::Failure(other) if !other.is_interrupted_only() => {
                                    Cause::both(cause, other)
                                }
                                _ => cause,
                            };
                            Effect::fail_cause(cause)
                        })
                    },
                )
            })
        })
    }

    /// Fails with `None` if `self` does not complete within `duration`.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.map(Some)
            .race(Effect::sleep(duration).widen_error::<E>().map(|()| None))
    }

    /// Delays the start of `self` by `duration`.
    pub fn delay(self, duration: Duration) -> Self {
        Effect::sleep(duration)
            .widen_error::<E>()
            .flat_map(move |()| self)
    }

    // ------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------

    /// Runs `self` with `service` added to the environment, restoring the
    /// previous environment afterwards.
    pub fn provide_service<S: Data>(self, service: S) -> Self {
        let env_ref = crate::context::current_environment().clone();
        Effect::environment()
            .widen_error::<E>()
            .flat_map(move |env| env_ref.locally(env.add(service), self))
    }
}

impl<A: Data, E: Data + fmt::Display> Effect<A, E> {
    /// Converts every typed failure into a defect carrying its rendering.
    pub fn or_die(self) -> Effect<A, Never> {
        Effect::from_expr(Expr::FoldCause(
            Box::new(self.expr),
            Box::new(Expr::Succeed),
            Box::new(|c| {
                Expr::FailCause(c.defected(|v| Defect::new(unerase::<E>(v).to_string())))
            }),
        ))
    }
}

impl<A: Data> Effect<A, Never> {
    /// Widens an infallible effect to any failure type.
    pub fn widen_error<E: Data>(self) -> Effect<A, E> {
        Effect::from_expr(self.expr)
    }
}

impl Effect<(), Never> {
    /// The unit effect.
    pub fn unit() -> Self {
        Self::from_expr(Expr::unit())
    }

    /// Yields the current fiber back to the scheduler.
    pub fn yield_now() -> Self {
        Self::from_expr(Expr::YieldNow)
    }

    /// Sleeps for `duration` on the ambient [`ClockService`]. Dies if no
    /// clock is provided, which the default runtime always does.
    pub fn sleep(duration: Duration) -> Self {
        service::<ClockService>()
            .or_die()
            .flat_map(move |clock| {
                Effect::async_(move |callback: AsyncCallback<(), Never>| {
                    let deadline = clock.0.now().saturating_add(duration);
                    let cb = callback.clone();
                    let key = clock.0.schedule(deadline, Box::new(move || cb.succeed(())));
                    let canceler = clock.clone();
                    Some(Effect::sync(move || canceler.0.cancel(key)))
                })
            })
    }
}

impl Effect<Environment, Never> {
    /// The current fiber's full environment.
    pub fn environment() -> Self {
        crate::context::current_environment().get()
    }
}

/// Looks up the service of type `S` in the current environment.
pub fn service<S: Data>() -> Effect<S, ServiceNotFound> {
    Effect::environment()
        .widen_error::<ServiceNotFound>()
        .flat_map(|env| Effect::from_result(env.get::<S>()))
}

/// Repeats `make`'s effect indefinitely; the only exits are failure or
/// interruption.
pub fn forever<A: Data, E: Data>(
    make: impl Fn() -> Effect<A, E> + Send + Sync + 'static,
) -> Effect<Never, E> {
    fn step<A: Data, E: Data>(
        make: Arc<dyn Fn() -> Effect<A, E> + Send + Sync>,
    ) -> Effect<Never, E> {
        Effect::suspend(move || {
            let again = Arc::clone(&make);
            make().flat_map(move |_| step(again))
        })
    }
    step(Arc::new(make))
}

/// Acquires a resource uninterruptibly, runs `use_` interruptibly, and
/// releases with the final exit no matter how `use_` ends.
pub fn acquire_release<R: Data, A: Data, E: Data>(
    acquire: Effect<R, E>,
    use_: impl FnOnce(R) -> Effect<A, E> + Send + 'static,
    release: impl FnOnce(R, &Exit<A, E>) -> Effect<(), Never> + Send + 'static,
) -> Effect<A, E> {
    Effect::uninterruptible_mask(move |mask| {
        acquire.flat_map(move |resource| {
            let for_release = resource.clone();
            mask.restore(use_(resource))
                .on_exit(move |exit| release(for_release, exit))
        })
    })
}

/// Capability handed to [`Effect::uninterruptible_mask`]: restores the
/// interruptibility that was in force outside the mask.
#[derive(Clone, Copy, Debug)]
pub struct InterruptMask {
    was_interruptible: bool,
}

impl InterruptMask {
    /// Runs `effect` with the pre-mask interruptibility.
    pub fn restore<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        let patch = if self.was_interruptible {
            FlagsPatch::enable(RuntimeFlags::INTERRUPTION)
        } else {
            FlagsPatch::disable(RuntimeFlags::INTERRUPTION)
        };
        Effect::from_expr(Expr::FlagsRegion {
            patch,
            body: Box::new(effect.expr),
        })
    }
}

/// Fire-once completion callback for [`Effect::async_`].
///
/// Clones share the fire-once latch: the first completion wins and the rest
/// are ignored, so a callback may be installed in several places (a timer
/// and an I/O readiness source, say) without double-resume hazards.
pub struct AsyncCallback<A, E = Never> {
    handle: crate::fiber::cell::ResumeHandle,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for AsyncCallback<A, E> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Data, E: Data> AsyncCallback<A, E> {
    /// Completes the suspended effect with a full exit.
    pub fn complete(&self, exit: Exit<A, E>) {
        self.handle.resume(Expr::from_exit(exit.erased()));
    }

    /// Completes with a success value.
    pub fn succeed(&self, value: A) {
        self.complete(Exit::succeed(value));
    }

    /// Completes with a typed failure.
    pub fn fail(&self, error: E) {
        self.complete(Exit::fail(error));
    }

    /// Completes with a full cause.
    pub fn fail_cause(&self, cause: Cause<E>) {
        self.complete(Exit::fail_cause(cause));
    }

    /// Whether some clone already completed the effect.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.handle.is_fired()
    }
}

impl<A, E> fmt::Debug for AsyncCallback<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AsyncCallback").field(&self.handle).finish()
    }
}
