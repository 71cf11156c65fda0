//! Scopes: lexically delimited resource lifetimes.
//!
//! A [`Scope`] collects finalizers while a region of effects runs and
//! releases them, in reverse registration order, when the region closes
//! with whatever exit ended it. [`scoped`] is the entry point: it opens a
//! scope, hands it to the body, and guarantees the close runs on success,
//! failure, and interruption alike. [`acquire_release`] composes with it
//! for the common one-resource case.
//!
//! [`acquire_release`]: crate::effect::acquire_release

mod release_map;

pub use release_map::{Finalizer, ReleaseMap};

use crate::effect::value::{AnyValue, Data, Never};
use crate::effect::Effect;
use crate::exit::Exit;

/// The erased exit a scope was closed with, as seen by finalizers.
pub type ScopeExit = Exit<AnyValue, AnyValue>;

/// How a closing scope runs its finalizers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    /// One at a time, newest registration first.
    #[default]
    Sequential,
    /// All at once, awaiting every one.
    Concurrent,
}

/// An open region that resources can tie their release to.
#[derive(Clone, Debug)]
pub struct Scope {
    releases: ReleaseMap,
    strategy: ExecutionStrategy,
}

impl Scope {
    /// Opens a scope that releases sequentially.
    #[must_use]
    pub fn make() -> Effect<Scope, Never> {
        Self::make_with(ExecutionStrategy::Sequential)
    }

    /// Opens a scope with an explicit release strategy.
    #[must_use]
    pub fn make_with(strategy: ExecutionStrategy) -> Effect<Scope, Never> {
        Effect::sync(move || Scope {
            releases: ReleaseMap::new(),
            strategy,
        })
    }

    /// The underlying finalizer registry.
    #[must_use]
    pub fn release_map(&self) -> &ReleaseMap {
        &self.releases
    }

    /// Registers a cleanup effect to run when the scope closes. If the
    /// scope is already closed the effect runs immediately.
    #[must_use]
    pub fn add_finalizer(&self, finalizer: Effect<(), Never>) -> Effect<(), Never> {
        self.releases
            .add_if_open(Finalizer::from_effect(finalizer))
            .discard()
    }

    /// Registers a cleanup action that can inspect the closing exit.
    #[must_use]
    pub fn add_finalizer_exit(
        &self,
        f: impl Fn(&ScopeExit) -> Effect<(), Never> + Send + Sync + 'static,
    ) -> Effect<(), Never> {
        self.releases.add_if_open(Finalizer::new(f)).discard()
    }

    /// Opens a child scope whose own close is tied to this scope: closing
    /// the parent closes any child still open, with the parent's exit.
    #[must_use]
    pub fn child(&self) -> Effect<Scope, Never> {
        let parent = self.releases.clone();
        let strategy = self.strategy;
        Scope::make_with(strategy).flat_map(move |child| {
            let releases = child.releases.clone();
            parent
                .add_if_open(Finalizer::new(move |exit| {
                    releases.release_all(exit.clone(), strategy)
                }))
                .map(move |_| child)
        })
    }

    /// Closes the scope with `exit`, running every pending finalizer.
    /// Idempotent; later additions release immediately.
    #[must_use]
    pub fn close<A: Data, E: Data>(&self, exit: Exit<A, E>) -> Effect<(), Never> {
        self.releases.release_all(exit.erased(), self.strategy)
    }

    /// Whether the scope has been closed.
    #[must_use]
    pub fn is_closed(&self) -> Effect<bool, Never> {
        self.releases.is_exited()
    }
}

/// Opens a scope around `f` and closes it with the body's exit, even on
/// failure or interruption.
#[must_use]
pub fn scoped<A: Data, E: Data>(
    f: impl FnOnce(Scope) -> Effect<A, E> + Send + 'static,
) -> Effect<A, E> {
    Scope::make().widen_error::<E>().flat_map(move |scope| {
        let closer = scope.clone();
        f(scope).on_exit(move |exit| closer.close(exit.clone()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn runtime() -> crate::runtime::Runtime {
        RuntimeConfig::new().worker_threads(2).build()
    }

    #[test]
    fn finalizers_run_newest_first() {
        let rt = runtime();
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let exit = rt.run(scoped(move |scope| {
            let later = scope.clone();
            let first = Arc::clone(&seen);
            let second = Arc::clone(&seen);
            scope
                .add_finalizer(Effect::sync(move || first.lock().push(1)))
                .flat_map(move |()| {
                    later.add_finalizer(Effect::sync(move || second.lock().push(2)))
                })
        }));
        assert!(exit.is_success());
        assert_eq!(*order.lock(), vec![2, 1]);
    }

    #[test]
    fn finalizer_sees_failing_exit() {
        let rt = runtime();
        let observed = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&observed);
        let exit = rt.run(scoped(move |scope| {
            scope
                .add_finalizer_exit(move |exit| {
                    let failed = exit.is_failure();
                    let slot = Arc::clone(&slot);
                    Effect::sync(move || *slot.lock() = Some(failed))
                })
                .widen_error::<String>()
                .flat_map(|()| Effect::<u32, String>::fail("boom".to_string()))
        }));
        assert!(exit.is_failure());
        assert_eq!(*observed.lock(), Some(true));
    }

    #[test]
    fn add_after_close_releases_immediately() {
        let rt = runtime();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let exit = rt.run(Scope::make().flat_map(move |scope| {
            let late = scope.clone();
            scope.close(Exit::<(), Never>::succeed(())).flat_map(move |()| {
                let flag = Arc::clone(&flag);
                late.add_finalizer(Effect::sync(move || *flag.lock() = true))
            })
        }));
        assert!(exit.is_success());
        assert!(*ran.lock());
    }

    #[test]
    fn close_is_idempotent() {
        let rt = runtime();
        let count = Arc::new(Mutex::new(0_u32));
        let hits = Arc::clone(&count);
        let exit = rt.run(Scope::make().flat_map(move |scope| {
            let again = scope.clone();
            let registered = scope.clone();
            registered
                .add_finalizer(Effect::sync(move || *hits.lock() += 1))
                .flat_map(move |()| scope.close(Exit::<(), Never>::succeed(())))
                .flat_map(move |()| again.close(Exit::<(), Never>::succeed(())))
        }));
        assert!(exit.is_success());
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn update_all_rewrites_pending_and_future() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&log);
        let exit = rt.run(Effect::suspend(move || {
            let map = ReleaseMap::new();
            let before = Arc::clone(&seen);
            let after = Arc::clone(&seen);
            let wrap_log = Arc::clone(&seen);
            let closer = map.clone();
            let late = map.clone();
            map.add_if_open(Finalizer::from_effect(Effect::sync(move || {
                before.lock().push("pending")
            })))
            .flat_map(move |_| {
                late.update_all(move |effect| {
                    let wrap_log = Arc::clone(&wrap_log);
                    Effect::sync(move || wrap_log.lock().push("wrapped")).flat_map(move |()| effect)
                })
            })
            .flat_map(move |()| {
                closer
                    .release_all(
                        Exit::<(), Never>::succeed(()).erased(),
                        ExecutionStrategy::Sequential,
                    )
                    .flat_map(move |()| {
                        closer.add_if_open(Finalizer::from_effect(Effect::sync(move || {
                            after.lock().push("future")
                        })))
                    })
            })
        }));
        assert!(exit.is_success());
        assert_eq!(
            *log.lock(),
            vec!["wrapped", "pending", "wrapped", "future"]
        );
    }
}
