//! Dynamic payload values flowing through the interpreter.
//!
//! The effect tree is type-erased internally: every success value, error
//! value, and fiber-ref value is an [`AnyValue`]. The typed [`Effect`]
//! wrapper restores static typing at the public surface and guarantees that
//! the payload stored under a given continuation is the type that
//! continuation expects, so a failed downcast is always an interpreter bug
//! and is surfaced as a defect.
//!
//! [`Effect`]: crate::effect::Effect

use std::any::Any;
use std::sync::Arc;

/// A type-erased, shareable payload value.
///
/// Values are reference-counted so a single terminal [`Exit`](crate::exit::Exit)
/// can be delivered to every observer of a fiber without copying.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Bound required of every value that flows through an effect.
///
/// Effects describe computations that may hop between worker threads and
/// whose results may be observed by several fibers, so payloads must be
/// `Send + Sync + 'static`. `Clone` is required because a terminal exit can
/// be handed to more than one observer; in the common single-observer case
/// the clone is elided (`Arc::try_unwrap` succeeds).
pub trait Data: Any + Send + Sync + Clone {}

impl<T: Any + Send + Sync + Clone> Data for T {}

/// Erases a typed value into an [`AnyValue`].
pub(crate) fn erase<A: Data>(value: A) -> AnyValue {
    Arc::new(value)
}

/// Recovers a typed value, consuming the erased handle.
///
/// # Panics
///
/// Panics if the payload is not an `A`. The combinators preserve the typing
/// discipline, so this indicates an interpreter bug; the panic is caught by
/// the run loop and converted into a defect.
pub(crate) fn unerase<A: Data>(value: AnyValue) -> A {
    match value.downcast::<A>() {
        Ok(v) => Arc::try_unwrap(v).unwrap_or_else(|shared| (*shared).clone()),
        Err(_) => panic!(
            "payload type confusion: expected {}",
            std::any::type_name::<A>()
        ),
    }
}

/// Recovers a typed value from a borrowed erased handle.
///
/// # Panics
///
/// Same contract as [`unerase`].
pub(crate) fn unerase_ref<A: Data>(value: &AnyValue) -> A {
    match value.downcast_ref::<A>() {
        Some(v) => v.clone(),
        None => panic!(
            "payload type confusion: expected {}",
            std::any::type_name::<A>()
        ),
    }
}

/// An uninhabited error type for effects that cannot fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Never {}

impl std::fmt::Display for Never {
    fn fmt(&self, _f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {}
    }
}

impl std::error::Error for Never {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_unerase_round_trip() {
        let v = erase(42_u32);
        assert_eq!(unerase::<u32>(v), 42);
    }

    #[test]
    fn unerase_ref_clones() {
        let v = erase(String::from("shared"));
        assert_eq!(unerase_ref::<String>(&v), "shared");
        // Still usable afterwards.
        assert_eq!(unerase::<String>(v), "shared");
    }

    #[test]
    #[should_panic(expected = "payload type confusion")]
    fn unerase_wrong_type_panics() {
        let v = erase(1_u8);
        let _ = unerase::<u16>(v);
    }
}
