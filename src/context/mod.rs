//! Fiber-local context: refs, the environment, and the well-known refs the
//! runtime itself relies on.
//!
//! The well-known refs are process-wide singletons created on first use.
//! They hold the pieces of ambient state that must travel through the
//! fork/join lattice: the service environment, the current supervisor, and
//! the logging context.

pub mod environment;
pub mod fiber_ref;
pub(crate) mod fiber_refs;

pub use environment::{Environment, EnvironmentPatch, ServiceNotFound};
pub use fiber_ref::FiberRef;
pub(crate) use fiber_refs::FiberRefs;

use crate::services::logger::LogSpan;
use crate::supervisor::{Supervisor, SupervisorPatch};
use std::sync::OnceLock;

/// The current fiber's service environment. Children inherit it; changes a
/// child makes reconcile into the parent on join as an environment patch,
/// so sibling additions merge instead of clobbering each other.
pub fn current_environment() -> &'static FiberRef<Environment, EnvironmentPatch> {
    static REF: OnceLock<FiberRef<Environment, EnvironmentPatch>> = OnceLock::new();
    REF.get_or_init(|| {
        FiberRef::with_patch(
            Environment::empty(),
            None,
            Environment::diff,
            |first, second| first.clone().and_then(second.clone()),
            |patch, old| patch.apply(old),
        )
    })
}

/// The supervisor observing fibers forked from the current fiber.
pub fn current_supervisor() -> &'static FiberRef<Supervisor, SupervisorPatch> {
    static REF: OnceLock<FiberRef<Supervisor, SupervisorPatch>> = OnceLock::new();
    REF.get_or_init(|| {
        FiberRef::with_patch(
            Supervisor::none(),
            None,
            Supervisor::diff,
            |first, second| first.and_then(second),
            |patch, old| patch.apply(old),
        )
    })
}

/// Key/value annotations attached to every log event; inherited on fork.
pub fn log_annotations() -> &'static FiberRef<Vec<(String, String)>> {
    static REF: OnceLock<FiberRef<Vec<(String, String)>>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::new(Vec::new()))
}

/// Open log spans. A forked child starts with no spans of its own.
pub fn log_spans() -> &'static FiberRef<Vec<LogSpan>> {
    static REF: OnceLock<FiberRef<Vec<LogSpan>>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::new_fork_reset(Vec::new(), Vec::new()))
}
