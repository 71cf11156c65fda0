//! The `Cause` failure algebra.
//!
//! A [`Cause`] is a full description of why a computation failed. Unlike a
//! plain error value it can represent:
//!
//! - a typed, expected failure ([`Cause::Fail`])
//! - an unexpected defect such as a panic ([`Cause::Die`])
//! - interruption by another fiber ([`Cause::Interrupt`])
//! - sequential composition of failures ([`Cause::Then`]) — a failure
//!   followed by a failing finalizer, for example
//! - parallel composition ([`Cause::Both`]) — both branches of a parallel
//!   zip failed, and neither is discarded
//!
//! Interruption is a distinct variant so cleanup code can special-case
//! "cancelled" against "failed": finalizers always run, but retry policies
//! never retry an interruption.

use crate::effect::value::AnyValue;
use crate::fiber::FiberId;
use core::fmt;
use std::sync::Arc;

/// An untyped defect payload: a panic or an invariant violation.
///
/// Defects carry a rendered message plus the original payload when one is
/// available, so diagnostics never lose the panic value.
#[derive(Clone)]
pub struct Defect {
    message: Arc<str>,
    payload: Option<AnyValue>,
}

impl Defect {
    /// Creates a defect from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
            payload: None,
        }
    }

    /// Creates a defect carrying an arbitrary payload value.
    #[must_use]
    pub fn with_payload(message: impl Into<String>, payload: AnyValue) -> Self {
        Self {
            message: Arc::from(message.into()),
            payload: Some(payload),
        }
    }

    /// Converts a caught panic payload into a defect.
    ///
    /// Recovers the conventional `&str` / `String` panic messages; anything
    /// else is kept as an opaque payload.
    #[must_use]
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            return Self::new(*s);
        }
        if let Some(s) = payload.downcast_ref::<String>() {
            return Self::new(s.clone());
        }
        Self {
            message: Arc::from("panic with non-string payload"),
            payload: None,
        }
    }

    /// The rendered defect message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The original payload, when one was preserved.
    #[must_use]
    pub fn payload(&self) -> Option<&AnyValue> {
        self.payload.as_ref()
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defect")
            .field("message", &self.message)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
    }
}

impl Eq for Defect {}

/// An algebraic description of why a computation failed.
#[derive(Clone, Debug, PartialEq)]
pub enum Cause<E> {
    /// No failure. The identity for both [`then`](Cause::then) and
    /// [`both`](Cause::both).
    Empty,
    /// A typed, expected failure.
    Fail(E),
    /// An unexpected defect (panic or invariant violation).
    Die(Defect),
    /// Interruption, attributed to the interrupting fiber.
    Interrupt(FiberId),
    /// Sequential composition: the left failure happened, then the right.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Parallel composition: both failures happened concurrently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
    /// A cause whose stack trace has been suppressed (flag records whether
    /// the trace was ever captured).
    Stackless(Box<Cause<E>>, bool),
}

impl<E> Cause<E> {
    /// A typed failure.
    #[must_use]
    pub fn fail(error: E) -> Self {
        Self::Fail(error)
    }

    /// A defect.
    #[must_use]
    pub fn die(defect: Defect) -> Self {
        Self::Die(defect)
    }

    /// Interruption by the given fiber.
    #[must_use]
    pub fn interrupt(fiber: FiberId) -> Self {
        Self::Interrupt(fiber)
    }

    /// Sequential composition, dropping `Empty` operands.
    #[must_use]
    pub fn then(self, that: Self) -> Self {
        match (self, that) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (l, r) => Self::Then(Box::new(l), Box::new(r)),
        }
    }

    /// Parallel composition, dropping `Empty` operands.
    #[must_use]
    pub fn both(self, that: Self) -> Self {
        match (self, that) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (l, r) => Self::Both(Box::new(l), Box::new(r)),
        }
    }

    /// Returns true if this cause contains no failure at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Fail(_) | Self::Die(_) | Self::Interrupt(_) => false,
            Self::Then(l, r) | Self::Both(l, r) => l.is_empty() && r.is_empty(),
            Self::Stackless(c, _) => c.is_empty(),
        }
    }

    /// Returns true if any part of this cause is an interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupt(_) => true,
            Self::Empty | Self::Fail(_) | Self::Die(_) => false,
            Self::Then(l, r) | Self::Both(l, r) => l.is_interrupted() || r.is_interrupted(),
            Self::Stackless(c, _) => c.is_interrupted(),
        }
    }

    /// Returns true if this cause consists solely of interruptions.
    #[must_use]
    pub fn is_interrupted_only(&self) -> bool {
        match self {
            Self::Empty | Self::Interrupt(_) => true,
            Self::Fail(_) | Self::Die(_) => false,
            Self::Then(l, r) | Self::Both(l, r) => {
                l.is_interrupted_only() && r.is_interrupted_only()
            }
            Self::Stackless(c, _) => c.is_interrupted_only(),
        }
    }

    /// Returns true if any part of this cause is a defect.
    #[must_use]
    pub fn is_die(&self) -> bool {
        match self {
            Self::Die(_) => true,
            Self::Empty | Self::Fail(_) | Self::Interrupt(_) => false,
            Self::Then(l, r) | Self::Both(l, r) => l.is_die() || r.is_die(),
            Self::Stackless(c, _) => c.is_die(),
        }
    }

    /// All typed failures, in left-to-right order.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.collect_failures(&mut out);
        out
    }

    fn collect_failures<'a>(&'a self, out: &mut Vec<&'a E>) {
        match self {
            Self::Fail(e) => out.push(e),
            Self::Empty | Self::Die(_) | Self::Interrupt(_) => {}
            Self::Then(l, r) | Self::Both(l, r) => {
                l.collect_failures(out);
                r.collect_failures(out);
            }
            Self::Stackless(c, _) => c.collect_failures(out),
        }
    }

    /// All defects, in left-to-right order.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.collect_defects(&mut out);
        out
    }

    fn collect_defects<'a>(&'a self, out: &mut Vec<&'a Defect>) {
        match self {
            Self::Die(d) => out.push(d),
            Self::Empty | Self::Fail(_) | Self::Interrupt(_) => {}
            Self::Then(l, r) | Self::Both(l, r) => {
                l.collect_defects(out);
                r.collect_defects(out);
            }
            Self::Stackless(c, _) => c.collect_defects(out),
        }
    }

    /// The fibers responsible for interruption, in left-to-right order.
    pub fn interruptors(&self) -> Vec<&FiberId> {
        let mut out = Vec::new();
        self.collect_interruptors(&mut out);
        out
    }

    fn collect_interruptors<'a>(&'a self, out: &mut Vec<&'a FiberId>) {
        match self {
            Self::Interrupt(id) => out.push(id),
            Self::Empty | Self::Fail(_) | Self::Die(_) => {}
            Self::Then(l, r) | Self::Both(l, r) => {
                l.collect_interruptors(out);
                r.collect_interruptors(out);
            }
            Self::Stackless(c, _) => c.collect_interruptors(out),
        }
    }

    /// Maps every typed failure, preserving the cause structure.
    #[must_use]
    pub fn map<F>(self, f: impl Fn(E) -> F) -> Cause<F> {
        self.map_with(&f)
    }

    fn map_with<F>(self, f: &impl Fn(E) -> F) -> Cause<F> {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(e) => Cause::Fail(f(e)),
            Self::Die(d) => Cause::Die(d),
            Self::Interrupt(id) => Cause::Interrupt(id),
            Self::Then(l, r) => Cause::Then(Box::new(l.map_with(f)), Box::new(r.map_with(f))),
            Self::Both(l, r) => Cause::Both(Box::new(l.map_with(f)), Box::new(r.map_with(f))),
            Self::Stackless(c, flag) => Cause::Stackless(Box::new(c.map_with(f)), flag),
        }
    }

    /// Converts every typed failure into a defect, preserving structure.
    /// The result carries any failure type since none remain.
    #[must_use]
    pub fn defected<F>(self, f: impl Fn(E) -> Defect) -> Cause<F> {
        self.defected_with(&f)
    }

    fn defected_with<F>(self, f: &impl Fn(E) -> Defect) -> Cause<F> {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(e) => Cause::Die(f(e)),
            Self::Die(d) => Cause::Die(d),
            Self::Interrupt(id) => Cause::Interrupt(id),
            Self::Then(l, r) => {
                Cause::Then(Box::new(l.defected_with(f)), Box::new(r.defected_with(f)))
            }
            Self::Both(l, r) => {
                Cause::Both(Box::new(l.defected_with(f)), Box::new(r.defected_with(f)))
            }
            Self::Stackless(c, flag) => Cause::Stackless(Box::new(c.defected_with(f)), flag),
        }
    }
}

impl<E: Clone> Cause<E> {
    /// Splits a cause into its first typed failure, or the whole cause when
    /// it contains none (defects and interruptions are not recoverable
    /// through the typed error channel).
    pub fn failure_or_cause(&self) -> Result<E, Cause<E>> {
        match self.failures().first() {
            Some(e) => Ok((*e).clone()),
            None => Err(self.clone()),
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "<empty>"),
            Self::Fail(e) => write!(f, "fail: {e:?}"),
            Self::Die(d) => write!(f, "die: {d}"),
            Self::Interrupt(id) => write!(f, "interrupted by {id}"),
            Self::Then(l, r) => write!(f, "({l}) then ({r})"),
            Self::Both(l, r) => write!(f, "({l}) both ({r})"),
            Self::Stackless(c, _) => write!(f, "{c}"),
        }
    }
}

/// A cause whose failure channel is type-erased, as used by the interpreter.
pub(crate) type DynCause = Cause<AnyValue>;

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(seq: u64) -> FiberId {
        FiberId::Gen {
            seq,
            started_at: crate::services::clock::Timestamp::ZERO,
        }
    }

    #[test]
    fn empty_is_identity_for_then_and_both() {
        let c: Cause<u32> = Cause::fail(7);
        assert_eq!(c.clone().then(Cause::Empty), c);
        assert_eq!(Cause::Empty.both(c.clone()), c);
    }

    #[test]
    fn interrupted_only_discriminates() {
        let only = Cause::<u32>::interrupt(fid(1)).both(Cause::interrupt(fid(2)));
        assert!(only.is_interrupted_only());
        let mixed = Cause::interrupt(fid(1)).then(Cause::fail(3_u32));
        assert!(mixed.is_interrupted());
        assert!(!mixed.is_interrupted_only());
    }

    #[test]
    fn failures_collected_in_order() {
        let c = Cause::fail(1_u8).then(Cause::fail(2).both(Cause::fail(3)));
        assert_eq!(c.failures(), vec![&1, &2, &3]);
    }

    #[test]
    fn failure_or_cause_prefers_typed_failure() {
        let c = Cause::<u8>::die(Defect::new("boom")).then(Cause::fail(9));
        assert_eq!(c.failure_or_cause(), Ok(9));
        let d = Cause::<u8>::die(Defect::new("boom"));
        assert!(d.failure_or_cause().is_err());
    }

    #[test]
    fn map_preserves_structure() {
        let c = Cause::fail(1_u16).both(Cause::interrupt(fid(4)));
        let mapped = c.map(|e| e + 1);
        assert_eq!(mapped.failures(), vec![&2_u16]);
        assert!(mapped.is_interrupted());
    }

    #[test]
    fn panic_payload_recovers_message() {
        let d = Defect::from_panic(Box::new("it broke"));
        assert_eq!(d.message(), "it broke");
        let d = Defect::from_panic(Box::new(String::from("owned")));
        assert_eq!(d.message(), "owned");
    }
}
