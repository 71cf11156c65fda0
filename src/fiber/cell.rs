//! The shared half of a fiber.
//!
//! A [`FiberCell`] is the part of a fiber visible from outside the
//! interpreter loop: its identity, lifecycle status, message mailbox, exit
//! slot, and exit observers. The interpreter state itself
//! ([`FiberRuntime`](crate::fiber::runtime::FiberRuntime)) is owned by
//! whichever worker is currently running the fiber and is never shared.
//!
//! All cross-fiber communication is message passing through the mailbox:
//! interruption requests and asynchronous resumptions are enqueued here and
//! drained by the interpreter at its loop head. Resumptions carry the
//! suspension epoch they answer, so a resume raced against a canceled
//! suspension is discarded instead of waking the wrong continuation.

use crate::cause::DynCause;
use crate::context::FiberRefs;
use crate::effect::Expr;
use crate::exit::DynExit;
use crate::fiber::FiberId;
use parking_lot::Mutex;
use slab::Slab;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback invoked with a fiber's exit once it completes.
pub(crate) type ExitObserver = Box<dyn FnOnce(DynExit) + Send>;

/// Hook the cell uses to put itself back on a run queue.
pub(crate) type ScheduleFn = Box<dyn Fn(Arc<FiberCell>) + Send + Sync>;

/// Where a fiber is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FiberStatus {
    /// Queued or currently being interpreted.
    Running,
    /// Parked on an asynchronous callback; only a message wakes it.
    Suspended {
        /// The suspension this park belongs to.
        epoch: u64,
        /// Human-readable description of what the fiber is waiting on.
        blocking_on: &'static str,
    },
    /// Terminal; the exit slot is populated.
    Done,
}

/// A message delivered to a fiber's mailbox.
pub(crate) enum FiberMessage {
    /// Request interruption with the given cause.
    Interrupt(DynCause),
    /// Answer the suspension identified by `epoch` with a continuation.
    Resume {
        epoch: u64,
        expr: Expr,
    },
    /// Observe the fiber's interpreter state from inside its own loop.
    Inspect(Box<dyn FnOnce(crate::fiber::FiberDump) + Send>),
}

struct FiberShared {
    status: FiberStatus,
    mailbox: VecDeque<FiberMessage>,
    observers: Slab<ExitObserver>,
    exit: Option<DynExit>,
    /// The fiber's final ref values, consumed by the joining fiber.
    refs_snapshot: Option<FiberRefs>,
    next_epoch: u64,
}

/// The externally-visible half of a fiber.
pub(crate) struct FiberCell {
    pub(crate) id: FiberId,
    shared: Mutex<FiberShared>,
    /// Parked interpreter state. Present exactly when no worker is running
    /// the fiber; a worker takes it to run a slice and stores it back on
    /// yield or suspension. Cleared for good on completion, which also
    /// breaks the `cell -> interpreter -> cell` reference cycle.
    interp: Mutex<Option<Box<crate::fiber::runtime::FiberRuntime>>>,
    schedule: ScheduleFn,
}

impl FiberCell {
    pub(crate) fn new(id: FiberId, schedule: ScheduleFn) -> Arc<Self> {
        Arc::new(Self {
            id,
            shared: Mutex::new(FiberShared {
                status: FiberStatus::Running,
                mailbox: VecDeque::new(),
                observers: Slab::new(),
                exit: None,
                refs_snapshot: None,
                next_epoch: 0,
            }),
            interp: Mutex::new(None),
            schedule,
        })
    }

    /// Parks the interpreter state back on the cell.
    pub(crate) fn store_runtime(&self, rt: Box<crate::fiber::runtime::FiberRuntime>) {
        *self.interp.lock() = Some(rt);
    }

    /// Claims the interpreter state for a run slice. `None` means another
    /// worker holds it or the fiber is done; the caller just moves on.
    pub(crate) fn take_runtime(&self) -> Option<Box<crate::fiber::runtime::FiberRuntime>> {
        self.interp.lock().take()
    }

    /// Delivers a message, waking the fiber if it is parked.
    ///
    /// A `Resume` answering anything but the current suspension epoch is
    /// stale (the suspension was canceled or already answered) and is
    /// dropped here when the fiber is parked; the interpreter filters the
    /// remainder when draining.
    pub(crate) fn send(self: &Arc<Self>, message: FiberMessage) {
        let wake = {
            let mut shared = self.shared.lock();
            match shared.status {
                FiberStatus::Done => return,
                FiberStatus::Suspended { epoch, .. } => {
                    if let FiberMessage::Resume { epoch: answered, .. } = &message {
                        if *answered != epoch {
                            return;
                        }
                    }
                    shared.mailbox.push_back(message);
                    shared.status = FiberStatus::Running;
                    true
                }
                FiberStatus::Running => {
                    shared.mailbox.push_back(message);
                    false
                }
            }
        };
        if wake {
            (self.schedule)(Arc::clone(self));
        }
    }

    /// Drains every pending message, oldest first.
    pub(crate) fn drain_mailbox(&self) -> VecDeque<FiberMessage> {
        std::mem::take(&mut self.shared.lock().mailbox)
    }

    /// Reserves the next suspension epoch. The interpreter allocates the
    /// epoch before running the async registration so the resume handle can
    /// carry it, and only parks afterwards.
    pub(crate) fn allocate_epoch(&self) -> u64 {
        let mut shared = self.shared.lock();
        shared.next_epoch += 1;
        shared.next_epoch
    }

    /// Attempts to park on `epoch`. Fails (returning `false`) if a message
    /// arrived since the mailbox was last drained, in which case the
    /// interpreter must keep running and drain it instead.
    pub(crate) fn try_park(&self, epoch: u64, blocking_on: &'static str) -> bool {
        let mut shared = self.shared.lock();
        if !shared.mailbox.is_empty() {
            return false;
        }
        shared.status = FiberStatus::Suspended { epoch, blocking_on };
        true
    }

    /// Records the terminal exit and notifies every observer, returning how
    /// many there were (zero means the exit went unobserved).
    pub(crate) fn complete(&self, exit: DynExit, refs: FiberRefs) -> usize {
        let observers: Vec<ExitObserver> = {
            let mut shared = self.shared.lock();
            debug_assert!(shared.exit.is_none(), "fiber completed twice");
            shared.exit = Some(exit.clone());
            shared.refs_snapshot = Some(refs);
            shared.status = FiberStatus::Done;
            shared.mailbox.clear();
            shared.observers.drain().collect()
        };
        let notified = observers.len();
        for observer in observers {
            observer(exit.clone());
        }
        notified
    }

    /// Registers an exit observer. If the fiber is already done the
    /// observer fires immediately and no key is returned.
    pub(crate) fn observe(&self, observer: ExitObserver) -> Option<usize> {
        let exit = {
            let mut shared = self.shared.lock();
            match shared.exit.clone() {
                Some(exit) => exit,
                None => return Some(shared.observers.insert(observer)),
            }
        };
        observer(exit);
        None
    }

    /// Removes a registered observer; a no-op if it already fired.
    pub(crate) fn remove_observer(&self, key: usize) {
        let mut shared = self.shared.lock();
        if shared.observers.contains(key) {
            shared.observers.remove(key);
        }
    }

    /// The exit, if the fiber has completed.
    pub(crate) fn poll(&self) -> Option<DynExit> {
        self.shared.lock().exit.clone()
    }

    /// The completed fiber's final ref values, if any. Consumed at most
    /// once, by the fiber that joins this one.
    pub(crate) fn take_refs_snapshot(&self) -> Option<FiberRefs> {
        self.shared.lock().refs_snapshot.take()
    }

    /// The fiber's current lifecycle status.
    pub(crate) fn status(&self) -> FiberStatus {
        self.shared.lock().status.clone()
    }
}

impl std::fmt::Debug for FiberCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberCell")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Fire-once handle resuming one particular suspension of one fiber.
///
/// Cloneable so registrations can hand it to several callbacks; only the
/// first `resume` wins, the rest are no-ops.
pub struct ResumeHandle {
    cell: Arc<FiberCell>,
    epoch: u64,
    fired: Arc<AtomicBool>,
}

impl Clone for ResumeHandle {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            epoch: self.epoch,
            fired: Arc::clone(&self.fired),
        }
    }
}

impl ResumeHandle {
    pub(crate) fn new(cell: Arc<FiberCell>, epoch: u64) -> Self {
        Self {
            cell,
            epoch,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Resumes the suspended fiber with `expr`. Only the first call has any
    /// effect.
    pub(crate) fn resume(&self, expr: Expr) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cell.send(FiberMessage::Resume {
            epoch: self.epoch,
            expr,
        });
    }

    /// Whether some clone of this handle already resumed the fiber.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ResumeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeHandle")
            .field("fiber", &self.cell.id)
            .field("epoch", &self.epoch)
            .field("fired", &self.is_fired())
            .finish()
    }
}
