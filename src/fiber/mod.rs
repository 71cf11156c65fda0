//! Fibers: lightweight, interruptible threads of effect execution.
//!
//! A fiber is the unit of concurrency: every effect runs on one, children
//! are forked into their parent's scope, and a parent that completes first
//! interrupts and awaits its remaining children. The [`Fiber`] handle is the
//! public face; the interpreter and its shared cell live in the private
//! submodules.

pub(crate) mod cell;
pub mod flags;
mod id;
pub(crate) mod runtime;

pub use cell::FiberStatus;
pub use id::FiberId;

use crate::cause::DynCause;
use crate::effect::value::{erase, unerase, Data, Never};
use crate::effect::{Effect, Expr};
use crate::exit::{DynExit, Exit};
use cell::{FiberCell, FiberMessage};
use flags::RuntimeFlags;
use std::marker::PhantomData;
use std::sync::Arc;

/// A point-in-time diagnostic snapshot of a fiber, taken from inside its
/// own interpreter loop.
#[derive(Clone, Debug)]
pub struct FiberDump {
    /// The fiber's identity.
    pub id: FiberId,
    /// Lifecycle status at the time of the snapshot.
    pub status: FiberStatus,
    /// Continuation stack frame kinds, outermost first.
    pub frames: Vec<&'static str>,
    /// The fiber's runtime flags.
    pub flags: RuntimeFlags,
}

/// A running (or completed) fiber producing an `A` or failing with an `E`.
///
/// Handles are cheap to clone and do not keep the fiber running; dropping
/// every handle does not interrupt it (its parent's scope does that).
pub struct Fiber<A, E = Never> {
    cell: Arc<FiberCell>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<A, E> std::fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.cell.id)
            .field("status", &self.cell.status())
            .finish()
    }
}

impl<A: Data, E: Data> Fiber<A, E> {
    pub(crate) fn from_cell(cell: Arc<FiberCell>) -> Self {
        Self {
            cell,
            _marker: PhantomData,
        }
    }

    /// This fiber's identity.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.cell.id.clone()
    }

    /// The fiber's lifecycle status right now.
    #[must_use]
    pub fn status(&self) -> FiberStatus {
        self.cell.status()
    }

    /// Waits for the fiber and succeeds or fails with its result. Joining
    /// also merges the child's fiber-ref changes into the caller.
    pub fn join(&self) -> Effect<A, E> {
        let cell = Arc::clone(&self.cell);
        Effect::from_expr(Expr::Async(Box::new(move |handle| {
            let child = Arc::clone(&cell);
            let key = cell.observe(Box::new(move |exit| {
                let snapshot_from = Arc::clone(&child);
                handle.resume(Expr::Stateful(Box::new(move |rt| {
                    if let Some(child_refs) = snapshot_from.take_refs_snapshot() {
                        let me = rt.id().clone();
                        rt.fiber_refs.join_child(&me, &child_refs);
                    }
                    Expr::from_exit(exit)
                })));
            }));
            key.map(|key| {
                Expr::Sync(Box::new(move || {
                    cell.remove_observer(key);
                    erase(())
                }))
            })
        })))
    }

    /// Waits for the fiber's exit without propagating failure or merging
    /// fiber refs.
    pub fn await_exit(&self) -> Effect<Exit<A, E>, Never> {
        self.await_raw()
    }

    /// The fiber's exit if it has already completed.
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>, Never> {
        let cell = Arc::clone(&self.cell);
        Effect::sync(move || cell.poll().map(DynExit::typed::<A, E>))
    }

    /// Interrupts the fiber as the calling fiber and waits for it to wind
    /// down, returning its exit.
    pub fn interrupt(&self) -> Effect<Exit<A, E>, Never> {
        let this = self.clone();
        self.interrupt_fork().flat_map(move |()| this.await_raw())
    }

    /// Requests interruption without waiting for the fiber to finish.
    pub fn interrupt_fork(&self) -> Effect<(), Never> {
        let cell = Arc::clone(&self.cell);
        Effect::from_expr(Expr::Stateful(Box::new(move |rt| {
            cell.send(FiberMessage::Interrupt(DynCause::interrupt(
                rt.id().clone(),
            )));
            Expr::unit()
        })))
    }

    /// Captures a diagnostic snapshot of the fiber: status, flags, and the
    /// kinds of frames on its continuation stack. A fiber that has already
    /// completed yields a terminal dump with an empty stack.
    pub fn dump(&self) -> Effect<FiberDump, Never> {
        let cell = Arc::clone(&self.cell);
        Effect::from_expr(Expr::Async(Box::new(move |handle| {
            // The exit observer covers the race where the fiber completes
            // (clearing its mailbox) before it sees the inspect message.
            let on_done = handle.clone();
            let done_cell = Arc::clone(&cell);
            let key = cell.observe(Box::new(move |_| {
                on_done.resume(Expr::Succeed(erase(FiberDump {
                    id: done_cell.id.clone(),
                    status: FiberStatus::Done,
                    frames: Vec::new(),
                    flags: RuntimeFlags::none(),
                })));
            }));
            let Some(key) = key else {
                return None;
            };
            cell.send(FiberMessage::Inspect(Box::new(move |dump| {
                handle.resume(Expr::Succeed(erase(dump)));
            })));
            let cleanup = Arc::clone(&cell);
            Some(Expr::Sync(Box::new(move || {
                cleanup.remove_observer(key);
                erase(())
            })))
        })))
    }

    fn await_raw(&self) -> Effect<Exit<A, E>, Never> {
        let cell = Arc::clone(&self.cell);
        Effect::from_expr(Expr::Async(Box::new(move |handle| {
            let key = cell.observe(Box::new(move |exit| {
                handle.resume(Expr::Succeed(erase(exit)));
            }));
            key.map(|key| {
                Expr::Sync(Box::new(move || {
                    cell.remove_observer(key);
                    erase(())
                }))
            })
        })))
        .map(DynExit::typed::<A, E>)
    }
}
