//! The typed service environment.
//!
//! An [`Environment`] is an immutable map from service type to service
//! value, threaded through fibers as the `current environment` fiber ref.
//! Because it travels through the fork/join lattice like any other fiber
//! ref, it has a patch algebra ([`EnvironmentPatch`]) derived by diffing two
//! environments, so services provided inside a child fiber reconcile into
//! the parent on join instead of overwriting unrelated additions.
//!
//! Service identity is the value's `TypeId`; callers wrap `Arc<dyn Trait>`
//! services in small newtypes (e.g. `ClockService`) to give them distinct
//! types.

use crate::effect::value::{erase, unerase_ref, AnyValue, Data};
use core::fmt;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
struct ServiceEntry {
    value: AnyValue,
    type_name: &'static str,
}

/// An immutable, typed service map.
#[derive(Clone, Default)]
pub struct Environment {
    services: HashMap<TypeId, ServiceEntry>,
}

impl Environment {
    /// The empty environment.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns a new environment with `service` added (replacing any
    /// existing service of the same type).
    #[must_use]
    pub fn add<S: Data>(&self, service: S) -> Self {
        let mut services = self.services.clone();
        services.insert(
            TypeId::of::<S>(),
            ServiceEntry {
                value: erase(service),
                type_name: std::any::type_name::<S>(),
            },
        );
        Self { services }
    }

    /// Right-biased union: services in `that` win on conflict.
    #[must_use]
    pub fn union(&self, that: &Environment) -> Self {
        let mut services = self.services.clone();
        for (k, v) in &that.services {
            services.insert(*k, v.clone());
        }
        Self { services }
    }

    /// Looks up the service of type `S`.
    pub fn get<S: Data>(&self) -> Result<S, ServiceNotFound> {
        match self.services.get(&TypeId::of::<S>()) {
            Some(entry) => Ok(unerase_ref::<S>(&entry.value)),
            None => Err(ServiceNotFound {
                type_name: std::any::type_name::<S>(),
            }),
        }
    }

    /// Whether a service of type `S` is present.
    #[must_use]
    pub fn contains<S: Data>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<S>())
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the environment is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Structural equality by service identity: the same set of types, each
    /// bound to the same shared value.
    #[must_use]
    pub fn eq_by_identity(&self, that: &Environment) -> bool {
        self.services.len() == that.services.len()
            && self.services.iter().all(|(k, v)| {
                that.services
                    .get(k)
                    .is_some_and(|w| Arc::ptr_eq(&v.value, &w.value))
            })
    }

    /// The patch turning `old` into `new`.
    #[must_use]
    pub fn diff(old: &Environment, new: &Environment) -> EnvironmentPatch {
        let mut patch = EnvironmentPatch::Empty;
        for (k, v) in &new.services {
            match old.services.get(k) {
                Some(w) if Arc::ptr_eq(&v.value, &w.value) => {}
                _ => {
                    patch = patch.and_then(EnvironmentPatch::Add {
                        key: *k,
                        entry_value: v.value.clone(),
                        type_name: v.type_name,
                    });
                }
            }
        }
        for (k, v) in &old.services {
            if !new.services.contains_key(k) {
                patch = patch.and_then(EnvironmentPatch::Remove {
                    key: *k,
                    type_name: v.type_name,
                });
            }
        }
        patch
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for entry in self.services.values() {
            set.entry(&entry.type_name);
        }
        set.finish()
    }
}

/// A change between two environments: additions/replacements and removals,
/// composed sequentially.
#[derive(Clone)]
pub enum EnvironmentPatch {
    /// No change.
    Empty,
    /// Apply the first patch, then the second.
    AndThen(Box<EnvironmentPatch>, Box<EnvironmentPatch>),
    /// Add or replace one service.
    Add {
        /// The service's type id.
        key: TypeId,
        /// The service value.
        entry_value: AnyValue,
        /// The service's type name, kept for diagnostics.
        type_name: &'static str,
    },
    /// Remove one service.
    Remove {
        /// The service's type id.
        key: TypeId,
        /// The service's type name, kept for diagnostics.
        type_name: &'static str,
    },
}

impl EnvironmentPatch {
    /// Sequential composition, dropping `Empty` operands.
    #[must_use]
    pub fn and_then(self, that: EnvironmentPatch) -> EnvironmentPatch {
        match (self, that) {
            (Self::Empty, p) | (p, Self::Empty) => p,
            (l, r) => Self::AndThen(Box::new(l), Box::new(r)),
        }
    }

    /// Applies the patch to an environment.
    #[must_use]
    pub fn apply(&self, env: &Environment) -> Environment {
        match self {
            Self::Empty => env.clone(),
            Self::AndThen(l, r) => r.apply(&l.apply(env)),
            Self::Add {
                key,
                entry_value,
                type_name,
            } => {
                let mut services = env.services.clone();
                services.insert(
                    *key,
                    ServiceEntry {
                        value: entry_value.clone(),
                        type_name,
                    },
                );
                Environment { services }
            }
            Self::Remove { key, .. } => {
                let mut services = env.services.clone();
                services.remove(key);
                Environment { services }
            }
        }
    }
}

impl fmt::Debug for EnvironmentPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::AndThen(l, r) => write!(f, "({l:?}; {r:?})"),
            Self::Add { type_name, .. } => write!(f, "Add({type_name})"),
            Self::Remove { type_name, .. } => write!(f, "Remove({type_name})"),
        }
    }
}

/// Error returned when a requested service is absent from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceNotFound {
    type_name: &'static str,
}

impl ServiceNotFound {
    /// The missing service's type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Display for ServiceNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service not found: {}", self.type_name)
    }
}

impl std::error::Error for ServiceNotFound {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Port(u16);

    #[derive(Clone, Debug, PartialEq)]
    struct Name(&'static str);

    #[test]
    fn add_and_get() {
        let env = Environment::empty().add(Port(8080));
        assert_eq!(env.get::<Port>(), Ok(Port(8080)));
        assert!(env.get::<Name>().is_err());
    }

    #[test]
    fn union_is_right_biased() {
        let left = Environment::empty().add(Port(1)).add(Name("l"));
        let right = Environment::empty().add(Port(2));
        let merged = left.union(&right);
        assert_eq!(merged.get::<Port>(), Ok(Port(2)));
        assert_eq!(merged.get::<Name>(), Ok(Name("l")));
    }

    #[test]
    fn diff_apply_round_trip() {
        let a = Environment::empty().add(Port(1)).add(Name("x"));
        let b = Environment::empty().add(Port(2));
        let patch = Environment::diff(&a, &b);
        assert!(patch.apply(&a).eq_by_identity(&b));
        // And the empty diff is a no-op.
        let nothing = Environment::diff(&a, &a);
        assert!(nothing.apply(&a).eq_by_identity(&a));
    }

    #[test]
    fn service_not_found_names_the_type() {
        let err = Environment::empty().get::<Port>().unwrap_err();
        assert!(err.to_string().contains("Port"));
    }
}
