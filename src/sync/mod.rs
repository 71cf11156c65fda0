//! Shared mutable state for fibers: [`Ref`] for atomic updates and
//! [`Deferred`] for set-once handoff.

mod deferred;
mod reference;

pub use deferred::Deferred;
pub use reference::Ref;
