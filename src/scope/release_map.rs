//! The finalizer registry backing a scope.

use crate::cause::Cause;
use crate::effect::value::Never;
use crate::effect::Effect;
use crate::scope::{ExecutionStrategy, ScopeExit};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

type UpdateFn = dyn Fn(Effect<(), Never>) -> Effect<(), Never> + Send + Sync;

/// A cleanup action run with the exit that closed its scope.
///
/// Cloneable so it can be stored, replaced, and handed back; the owning
/// [`ReleaseMap`] guarantees each registered finalizer runs at most once.
#[derive(Clone)]
pub struct Finalizer(Arc<dyn Fn(&ScopeExit) -> Effect<(), Never> + Send + Sync>);

impl Finalizer {
    /// A finalizer that can inspect the closing exit.
    #[must_use]
    pub fn new(f: impl Fn(&ScopeExit) -> Effect<(), Never> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// A finalizer that runs `effect` regardless of the closing exit.
    #[must_use]
    pub fn from_effect(effect: Effect<(), Never>) -> Self {
        let slot = Mutex::new(Some(effect));
        Self::new(move |_| slot.lock().take().unwrap_or_else(Effect::unit))
    }

    /// The finalizer's effect for the given exit.
    #[must_use]
    pub fn run(&self, exit: &ScopeExit) -> Effect<(), Never> {
        (self.0)(exit)
    }

    fn transformed(self, f: &Arc<UpdateFn>) -> Self {
        let f = Arc::clone(f);
        Self::new(move |exit| f(self.run(exit)))
    }
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Finalizer")
    }
}

enum MapState {
    Running {
        next_key: u64,
        finalizers: BTreeMap<u64, Finalizer>,
        update: Option<Arc<UpdateFn>>,
    },
    Exited {
        exit: ScopeExit,
        update: Option<Arc<UpdateFn>>,
    },
}

fn compose(slot: &mut Option<Arc<UpdateFn>>, f: &Arc<UpdateFn>) {
    *slot = Some(match slot.take() {
        None => Arc::clone(f),
        Some(existing) => {
            let f = Arc::clone(f);
            Arc::new(move |effect| f(existing(effect)))
        }
    });
}

/// Keyed finalizer storage with exactly-once release semantics.
///
/// While running, finalizers are added under fresh keys and released
/// individually or all at once. Once the map has exited, late additions run
/// immediately with the recorded exit instead of being stored.
#[derive(Clone)]
pub struct ReleaseMap {
    state: Arc<Mutex<MapState>>,
}

impl Default for ReleaseMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MapState::Running {
                next_key: 1,
                finalizers: BTreeMap::new(),
                update: None,
            })),
        }
    }

    /// Creates a release map as an effect.
    #[must_use]
    pub fn make() -> Effect<ReleaseMap, Never> {
        Effect::sync(ReleaseMap::new)
    }

    /// Adds a finalizer if the map is still open, returning its key. If the
    /// map has exited the finalizer runs now, with the recorded exit, and
    /// no key is returned.
    #[must_use]
    pub fn add_if_open(&self, finalizer: Finalizer) -> Effect<Option<u64>, Never> {
        let state = Arc::clone(&self.state);
        Effect::suspend(move || {
            enum Action {
                Added(u64),
                RunNow(Finalizer, ScopeExit),
            }
            let action = {
                let mut guard = state.lock();
                match &mut *guard {
                    MapState::Running {
                        next_key,
                        finalizers,
                        update,
                    } => {
                        let key = *next_key;
                        *next_key += 1;
                        let finalizer = match update {
                            Some(f) => finalizer.transformed(f),
                            None => finalizer,
                        };
                        finalizers.insert(key, finalizer);
                        Action::Added(key)
                    }
                    MapState::Exited { exit, update } => {
                        let finalizer = match update {
                            Some(f) => finalizer.transformed(f),
                            None => finalizer,
                        };
                        Action::RunNow(finalizer, exit.clone())
                    }
                }
            };
            match action {
                Action::Added(key) => Effect::succeed(Some(key)),
                Action::RunNow(finalizer, exit) => finalizer.run(&exit).map(|()| None),
            }
        })
    }

    /// Runs and removes the finalizer under `key` with the given exit. A
    /// no-op if the key is absent or the map has already exited.
    #[must_use]
    pub fn release(&self, key: u64, exit: ScopeExit) -> Effect<(), Never> {
        let state = Arc::clone(&self.state);
        Effect::suspend(move || {
            let finalizer = match &mut *state.lock() {
                MapState::Running { finalizers, .. } => finalizers.remove(&key),
                MapState::Exited { .. } => None,
            };
            match finalizer {
                Some(finalizer) => finalizer.run(&exit),
                None => Effect::unit(),
            }
        })
    }

    /// Replaces the finalizer under `key`, returning the previous one. If
    /// the map has exited the replacement runs immediately and nothing is
    /// returned.
    #[must_use]
    pub fn replace(&self, key: u64, finalizer: Finalizer) -> Effect<Option<Finalizer>, Never> {
        let state = Arc::clone(&self.state);
        Effect::suspend(move || {
            enum Action {
                Replaced(Option<Finalizer>),
                RunNow(Finalizer, ScopeExit),
            }
            let action = {
                let mut guard = state.lock();
                match &mut *guard {
                    MapState::Running {
                        finalizers, update, ..
                    } => {
                        let finalizer = match update {
                            Some(f) => finalizer.transformed(f),
                            None => finalizer,
                        };
                        Action::Replaced(finalizers.insert(key, finalizer))
                    }
                    MapState::Exited { exit, update } => {
                        let finalizer = match update {
                            Some(f) => finalizer.transformed(f),
                            None => finalizer,
                        };
                        Action::RunNow(finalizer, exit.clone())
                    }
                }
            };
            match action {
                Action::Replaced(old) => Effect::succeed(old),
                Action::RunNow(finalizer, exit) => finalizer.run(&exit).map(|()| None),
            }
        })
    }

    /// Rewrites every pending finalizer, and every finalizer added from now
    /// on, through `f`.
    #[must_use]
    pub fn update_all(
        &self,
        f: impl Fn(Effect<(), Never>) -> Effect<(), Never> + Send + Sync + 'static,
    ) -> Effect<(), Never> {
        let state = Arc::clone(&self.state);
        Effect::sync(move || {
            let f: Arc<UpdateFn> = Arc::new(f);
            match &mut *state.lock() {
                MapState::Running {
                    finalizers, update, ..
                } => {
                    compose(update, &f);
                    for finalizer in finalizers.values_mut() {
                        *finalizer = finalizer.clone().transformed(&f);
                    }
                }
                MapState::Exited { update, .. } => compose(update, &f),
            }
        })
    }

    /// Exits the map, running every pending finalizer with `exit`. All
    /// finalizers run even when some fail; their causes are combined into
    /// the resulting defect cause. Idempotent.
    #[must_use]
    pub fn release_all(&self, exit: ScopeExit, strategy: ExecutionStrategy) -> Effect<(), Never> {
        let state = Arc::clone(&self.state);
        Effect::suspend(move || {
            let pending: Vec<Finalizer> = {
                let mut guard = state.lock();
                if matches!(&*guard, MapState::Exited { .. }) {
                    return Effect::unit();
                }
                let prev = std::mem::replace(
                    &mut *guard,
                    MapState::Exited {
                        exit: exit.clone(),
                        update: None,
                    },
                );
                let MapState::Running {
                    finalizers, update, ..
                } = prev
                else {
                    return Effect::unit();
                };
                *guard = MapState::Exited {
                    exit: exit.clone(),
                    update,
                };
                // Newest registration first.
                finalizers.into_values().rev().collect()
            };
            match strategy {
                ExecutionStrategy::Sequential => {
                    pending.into_iter().fold(Effect::unit(), |acc, finalizer| {
                        let exit = exit.clone();
                        sequence_causes(acc, Effect::suspend(move || finalizer.run(&exit)))
                    })
                }
                ExecutionStrategy::Concurrent => {
                    pending.into_iter().fold(Effect::unit(), |acc, finalizer| {
                        let exit = exit.clone();
                        acc.zip_par(Effect::suspend(move || finalizer.run(&exit)))
                            .discard()
                    })
                }
            }
        })
    }

    /// Whether the map has exited.
    #[must_use]
    pub fn is_exited(&self) -> Effect<bool, Never> {
        let state = Arc::clone(&self.state);
        Effect::sync(move || matches!(&*state.lock(), MapState::Exited { .. }))
    }
}

impl std::fmt::Debug for ReleaseMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.state.lock() {
            MapState::Running { finalizers, .. } => f
                .debug_struct("ReleaseMap")
                .field("pending", &finalizers.len())
                .finish(),
            MapState::Exited { .. } => f.debug_struct("ReleaseMap").field("exited", &true).finish(),
        }
    }
}

/// Runs both effects in order, keeping every failure cause.
fn sequence_causes(first: Effect<(), Never>, second: Effect<(), Never>) -> Effect<(), Never> {
    outcome(first).flat_map(move |head| {
        outcome(second).flat_map(move |tail| match (head, tail) {
            (None, None) => Effect::unit(),
            (Some(cause), None) | (None, Some(cause)) => Effect::fail_cause(cause),
            (Some(head), Some(tail)) => Effect::fail_cause(head.then(tail)),
        })
    })
}

fn outcome(effect: Effect<(), Never>) -> Effect<Option<Cause<Never>>, Never> {
    effect.fold_cause(
        |()| Effect::succeed(None),
        |cause| Effect::succeed(Some(cause)),
    )
}
