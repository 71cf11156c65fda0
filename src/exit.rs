//! Terminal fiber results.
//!
//! An [`Exit`] is how every fiber ends: either a success value or a
//! [`Cause`] describing the failure. Exits are plain data and may be
//! delivered to any number of observers.

use crate::cause::{Cause, Defect};
use crate::effect::value::{erase, unerase, AnyValue, Data};
use crate::fiber::FiberId;

/// The terminal result of running an effect or fiber.
#[derive(Clone, Debug, PartialEq)]
pub enum Exit<A, E> {
    /// The computation produced a value.
    Success(A),
    /// The computation failed with the given cause.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// A successful exit.
    #[must_use]
    pub fn succeed(value: A) -> Self {
        Self::Success(value)
    }

    /// A failed exit with a typed error.
    #[must_use]
    pub fn fail(error: E) -> Self {
        Self::Failure(Cause::fail(error))
    }

    /// A failed exit with a full cause.
    #[must_use]
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::Failure(cause)
    }

    /// An exit describing a defect.
    #[must_use]
    pub fn die(defect: Defect) -> Self {
        Self::Failure(Cause::die(defect))
    }

    /// An exit describing interruption by the given fiber.
    #[must_use]
    pub fn interrupt(fiber: FiberId) -> Self {
        Self::Failure(Cause::interrupt(fiber))
    }

    /// Returns true for [`Exit::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns true for [`Exit::Failure`].
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Returns true if the exit is a failure containing an interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Failure(c) if c.is_interrupted())
    }

    /// The success value, if any.
    #[must_use]
    pub fn success(self) -> Option<A> {
        match self {
            Self::Success(a) => Some(a),
            Self::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Self::Success(_) => None,
            Self::Failure(c) => Some(c),
        }
    }

    /// Maps the success channel.
    #[must_use]
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Self::Success(a) => Exit::Success(f(a)),
            Self::Failure(c) => Exit::Failure(c),
        }
    }

    /// Maps the typed error channel, preserving the cause structure.
    #[must_use]
    pub fn map_error<F>(self, f: impl Fn(E) -> F) -> Exit<A, F> {
        match self {
            Self::Success(a) => Exit::Success(a),
            Self::Failure(c) => Exit::Failure(c.map(f)),
        }
    }
}

impl<A, E: Clone> Exit<A, E> {
    /// Converts into a `Result`, collapsing the cause to its first typed
    /// failure. Defect-only and interrupt-only causes become `Err(None)`.
    pub fn into_result(self) -> Result<A, Option<E>> {
        match self {
            Self::Success(a) => Ok(a),
            Self::Failure(c) => Err(c.failure_or_cause().ok()),
        }
    }
}

/// An exit whose channels are type-erased, as stored on a completed fiber.
pub(crate) type DynExit = Exit<AnyValue, AnyValue>;

impl DynExit {
    /// Restores the typed view of an erased exit.
    pub(crate) fn typed<A: Data, E: Data>(self) -> Exit<A, E> {
        match self {
            Self::Success(v) => Exit::Success(unerase::<A>(v)),
            Self::Failure(c) => Exit::Failure(c.map(|e| unerase_err::<E>(&e))),
        }
    }
}

fn unerase_err<E: Data>(value: &AnyValue) -> E {
    crate::effect::value::unerase_ref::<E>(value)
}

impl<A: Data, E: Data> Exit<A, E> {
    /// Erases the typed channels for storage on a fiber.
    pub(crate) fn erased(self) -> DynExit {
        match self {
            Self::Success(a) => Exit::Success(erase(a)),
            Self::Failure(c) => Exit::Failure(c.map(|e| erase(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_erased_round_trip() {
        let exit: Exit<u32, String> = Exit::succeed(5);
        assert_eq!(exit.clone().erased().typed::<u32, String>(), exit);

        let exit: Exit<u32, String> = Exit::fail("no".into());
        assert_eq!(exit.clone().erased().typed::<u32, String>(), exit);
    }

    #[test]
    fn into_result_collapses_cause() {
        let exit: Exit<u8, &'static str> = Exit::fail("e");
        assert_eq!(exit.into_result(), Err(Some("e")));
        let exit: Exit<u8, &'static str> = Exit::die(Defect::new("boom"));
        assert_eq!(exit.into_result(), Err(None));
    }
}
