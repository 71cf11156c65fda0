//! The fiber interpreter.
//!
//! A [`FiberRuntime`] evaluates one effect tree on an explicit continuation
//! stack (a trampoline): sequential composition pushes frames, terminal
//! nodes pop them, and the native call stack stays flat no matter how deep
//! the bind chain goes. Between any two nodes the interpreter may deliver a
//! pending interrupt, yield cooperatively once its operation budget is
//! spent, or park on an asynchronous callback.
//!
//! Interruption protocol: interrupt requests arrive as mailbox messages and
//! are latched in `pending_interrupt`. They are delivered only when the
//! fiber's flags say it is interruptible, at well-defined points: the loop
//! head, entry to a flags region, and the pop of a flags-restore frame (so
//! an interrupt received inside an uninterruptible region lands immediately
//! after it closes). Finalizers run in wind-down mode and cannot be cut
//! short; while the fiber is unwinding from a delivered interrupt, user
//! error handlers in interruptible code are skipped so interruption cannot
//! be silently swallowed.

use crate::cause::{Defect, DynCause};
use crate::context::FiberRefs;
use crate::effect::expr::{Expr, FinalizerFn};
use crate::effect::value::{erase, unerase, AnyValue};
use crate::exit::DynExit;
use crate::fiber::cell::{FiberCell, FiberMessage, ResumeHandle};
use crate::fiber::flags::{FlagsPatch, RuntimeFlags};
use crate::fiber::FiberId;
use crate::runtime::executor::Executor;
use crate::supervisor::Supervisor;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Why a run slice ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    /// Budget spent or explicit yield; requeue the fiber.
    Yielded,
    /// Parked on an asynchronous callback; a mailbox message wakes it.
    Suspended,
    /// The fiber completed and its exit is recorded on the cell.
    Done,
}

/// A continuation frame on the fiber's own stack.
enum Frame {
    OnSuccess(Box<dyn FnOnce(AnyValue) -> Expr + Send>),
    OnSuccessAndFailure(
        Box<dyn FnOnce(AnyValue) -> Expr + Send>,
        Box<dyn FnOnce(DynCause) -> Expr + Send>,
    ),
    Finalizer(FinalizerFn),
    RestoreFlags(RuntimeFlags),
}

impl Frame {
    fn kind(&self) -> &'static str {
        match self {
            Frame::OnSuccess(_) => "FlatMap",
            Frame::OnSuccessAndFailure(..) => "FoldCause",
            Frame::Finalizer(_) => "OnExit",
            Frame::RestoreFlags(_) => "FlagsRegion",
        }
    }
}

/// One fiber's interpreter state. Owned by at most one worker at a time.
pub(crate) struct FiberRuntime {
    cell: Arc<FiberCell>,
    executor: Arc<Executor>,
    pub(crate) fiber_refs: FiberRefs,
    stack: SmallVec<[Frame; 8]>,
    flags: RuntimeFlags,
    current: Option<Expr>,
    pending_interrupt: Option<DynCause>,
    /// Set once a pending interrupt has been delivered; cleared never.
    interrupting: bool,
    /// The suspension epoch being awaited, or zero when not suspended.
    awaited_epoch: u64,
    canceler: Option<Expr>,
    children: Vec<Weak<FiberCell>>,
    op_budget: u32,
}

impl FiberRuntime {
    pub(crate) fn new(
        cell: Arc<FiberCell>,
        expr: Expr,
        fiber_refs: FiberRefs,
        flags: RuntimeFlags,
        executor: Arc<Executor>,
        op_budget: u32,
    ) -> Self {
        Self {
            cell,
            executor,
            fiber_refs,
            stack: SmallVec::new(),
            flags,
            current: Some(expr),
            pending_interrupt: None,
            interrupting: false,
            awaited_epoch: 0,
            canceler: None,
            children: Vec::new(),
            op_budget,
        }
    }

    /// The identity of this fiber.
    pub(crate) fn id(&self) -> &FiberId {
        &self.cell.id
    }

    /// The fiber's current runtime flags.
    pub(crate) fn flags(&self) -> RuntimeFlags {
        self.flags
    }

    /// Runs one slice of this fiber, until it yields, parks, or completes.
    pub(crate) fn run(&mut self) -> StepOutcome {
        let mut ops: u32 = 0;
        loop {
            for message in self.cell.drain_mailbox() {
                self.handle_message(message);
            }

            if self.current.is_none() {
                // Parked on a suspension: an interrupt cancels it, anything
                // else re-parks.
                if self.flags.interruptible() {
                    if let Some(cause) = self.pending_interrupt.take() {
                        self.interrupting = true;
                        self.awaited_epoch = 0;
                        let fail = Expr::FailCause(cause);
                        self.current = Some(match self.canceler.take() {
                            Some(canceler) => Expr::OnExit {
                                body: Box::new(fail),
                                finalizer: Box::new(move |_| canceler),
                            },
                            None => fail,
                        });
                    }
                }
                if self.current.is_none() {
                    if self.cell.try_park(self.awaited_epoch, "async") {
                        return StepOutcome::Suspended;
                    }
                    // A message slipped in between drain and park.
                    continue;
                }
            } else if self.flags.interruptible() && !self.interrupting {
                if let Some(cause) = self.pending_interrupt.take() {
                    self.interrupting = true;
                    self.canceler = None;
                    self.current = Some(Expr::FailCause(cause));
                }
            }

            ops += 1;
            if ops > self.op_budget && self.flags.cooperative_yielding() {
                return StepOutcome::Yielded;
            }

            let Some(expr) = self.current.take() else {
                continue;
            };
            match expr {
                Expr::Succeed(value) => {
                    if let Some(exit) = self.continue_with(value) {
                        if self.finish(exit) {
                            return StepOutcome::Done;
                        }
                    }
                }
                Expr::FailCause(cause) => {
                    if let Some(exit) = self.unwind(cause) {
                        if self.finish(exit) {
                            return StepOutcome::Done;
                        }
                    }
                }
                Expr::Sync(thunk) => {
                    self.current = Some(catching(move || Expr::Succeed(thunk())));
                }
                Expr::Suspend(make) => {
                    self.current = Some(catching(make));
                }
                Expr::FlatMap(inner, on_success) => {
                    self.stack.push(Frame::OnSuccess(on_success));
                    self.current = Some(*inner);
                }
                Expr::FoldCause(inner, on_success, on_failure) => {
                    self.stack
                        .push(Frame::OnSuccessAndFailure(on_success, on_failure));
                    self.current = Some(*inner);
                }
                Expr::Async(register) => {
                    let epoch = self.cell.allocate_epoch();
                    self.awaited_epoch = epoch;
                    let handle = ResumeHandle::new(Arc::clone(&self.cell), epoch);
                    match panic::catch_unwind(AssertUnwindSafe(move || register(handle))) {
                        Ok(canceler) => {
                            self.canceler = canceler;
                            self.current = None;
                        }
                        Err(payload) => {
                            self.awaited_epoch = 0;
                            self.current = Some(Expr::FailCause(DynCause::die(
                                Defect::from_panic(payload),
                            )));
                        }
                    }
                }
                Expr::Fork(body) => {
                    let child = self.spawn_child(*body);
                    if let Some(exit) = self.continue_with(erase(child)) {
                        if self.finish(exit) {
                            return StepOutcome::Done;
                        }
                    }
                }
                Expr::Race(left, right) => self.start_race(*left, *right),
                Expr::FlagsRegion { patch, body } => {
                    self.stack.push(Frame::RestoreFlags(self.flags));
                    self.flags = self.flags.patch(patch);
                    self.current = Some(*body);
                }
                Expr::GetRef(reference) => {
                    let value = self.fiber_refs.get(&reference);
                    if let Some(exit) = self.continue_with(value) {
                        if self.finish(exit) {
                            return StepOutcome::Done;
                        }
                    }
                }
                Expr::SetRef(reference, value) => {
                    let id = self.cell.id.clone();
                    self.fiber_refs.set(&id, &reference, value);
                    if let Some(exit) = self.continue_with(erase(())) {
                        if self.finish(exit) {
                            return StepOutcome::Done;
                        }
                    }
                }
                Expr::OnExit { body, finalizer } => {
                    self.stack.push(Frame::Finalizer(finalizer));
                    self.current = Some(*body);
                }
                Expr::Stateful(step) => {
                    self.current =
                        Some(match panic::catch_unwind(AssertUnwindSafe(|| step(self))) {
                            Ok(expr) => expr,
                            Err(payload) => {
                                Expr::FailCause(DynCause::die(Defect::from_panic(payload)))
                            }
                        });
                }
                Expr::YieldNow => {
                    self.current = Some(Expr::unit());
                    return StepOutcome::Yielded;
                }
            }
        }
    }

    fn handle_message(&mut self, message: FiberMessage) {
        match message {
            FiberMessage::Interrupt(cause) => {
                self.pending_interrupt = Some(match self.pending_interrupt.take() {
                    None => cause,
                    Some(existing) => existing.then(cause),
                });
            }
            FiberMessage::Resume { epoch, expr } => {
                if epoch == self.awaited_epoch && self.current.is_none() {
                    self.awaited_epoch = 0;
                    self.canceler = None;
                    self.current = Some(expr);
                }
            }
            FiberMessage::Inspect(observe) => observe(self.dump()),
        }
    }

    /// A point-in-time diagnostic snapshot, taken on the fiber's own worker
    /// so the continuation stack can be read without sharing it.
    fn dump(&self) -> crate::fiber::FiberDump {
        crate::fiber::FiberDump {
            id: self.cell.id.clone(),
            status: self.cell.status(),
            frames: self.stack.iter().map(Frame::kind).collect(),
            flags: self.flags,
        }
    }

    /// Pops frames with a success value. Returns the fiber's exit when the
    /// stack runs out; otherwise sets `current` and returns `None`.
    fn continue_with(&mut self, value: AnyValue) -> Option<DynExit> {
        loop {
            match self.stack.pop() {
                None => return Some(DynExit::Success(value)),
                Some(Frame::OnSuccess(k) | Frame::OnSuccessAndFailure(k, _)) => {
                    self.current = Some(catching(move || k(value)));
                    return None;
                }
                Some(Frame::Finalizer(finalizer)) => {
                    let exit = DynExit::Success(value);
                    let step = catch_finalizer(finalizer, &exit);
                    self.current = Some(after_finalizer(step, exit));
                    return None;
                }
                Some(Frame::RestoreFlags(saved)) => {
                    self.flags = saved;
                    if self.flags.interruptible() && !self.interrupting {
                        if let Some(cause) = self.pending_interrupt.take() {
                            self.interrupting = true;
                            self.current = Some(Expr::FailCause(cause));
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Pops frames with a failing cause. While the fiber is unwinding from a
    /// delivered interrupt, error handlers in interruptible code are
    /// skipped; handlers inside uninterruptible (or wind-down) regions still
    /// run, which is what lets finalizer plumbing observe the cause.
    fn unwind(&mut self, mut cause: DynCause) -> Option<DynExit> {
        loop {
            match self.stack.pop() {
                None => return Some(DynExit::Failure(cause)),
                Some(Frame::OnSuccess(_)) => {}
                Some(Frame::OnSuccessAndFailure(_, handler)) => {
                    if self.interrupting && self.flags.interruptible() {
                        continue;
                    }
                    self.current = Some(catching(move || handler(cause)));
                    return None;
                }
                Some(Frame::Finalizer(finalizer)) => {
                    let exit = DynExit::Failure(cause);
                    let step = catch_finalizer(finalizer, &exit);
                    self.current = Some(after_finalizer(step, exit));
                    return None;
                }
                Some(Frame::RestoreFlags(saved)) => {
                    self.flags = saved;
                    if self.flags.interruptible() {
                        if let Some(extra) = self.pending_interrupt.take() {
                            self.interrupting = true;
                            cause = cause.then(extra);
                        }
                    }
                }
            }
        }
    }

    /// Spawns `body` as a child fiber in this fiber's scope.
    fn spawn_child(&mut self, body: Expr) -> Arc<FiberCell> {
        let child_id = self.executor.next_fiber_id();
        let refs = self.fiber_refs.forked(&child_id);
        if self.flags.op_supervision() {
            self.supervisor().on_start(self.id(), &child_id);
        }
        // Children start interruptible regardless of the parent's mask.
        let child_flags = self
            .flags
            .enable(RuntimeFlags::INTERRUPTION)
            .disable(RuntimeFlags::WIND_DOWN);
        let cell = self.executor.spawn(child_id, body, refs, child_flags);
        tracing::trace!(parent = %self.cell.id, child = %cell.id, "forked fiber");
        if self.children.len() >= 16 {
            self.children
                .retain(|w| w.upgrade().is_some_and(|c| c.poll().is_none()));
        }
        self.children.push(Arc::downgrade(&cell));
        cell
    }

    /// Forks both sides and parks until the first completes; the winner's
    /// exit resumes this fiber and the loser is interrupted under a
    /// composite id naming both contestants.
    fn start_race(&mut self, left: Expr, right: Expr) {
        let epoch = self.cell.allocate_epoch();
        self.awaited_epoch = epoch;
        let handle = ResumeHandle::new(Arc::clone(&self.cell), epoch);

        let left_cell = self.spawn_child(left);
        let right_cell = self.spawn_child(right);
        let racer = FiberId::composite(left_cell.id.clone(), right_cell.id.clone());

        for (winner, loser) in [
            (&left_cell, Arc::clone(&right_cell)),
            (&right_cell, Arc::clone(&left_cell)),
        ] {
            let handle = handle.clone();
            let racer = racer.clone();
            winner.observe(Box::new(move |exit| {
                loser.send(FiberMessage::Interrupt(DynCause::interrupt(racer)));
                handle.resume(Expr::from_exit(exit));
            }));
        }

        // Interrupting the race interrupts both contestants; they are also
        // children, so scope teardown awaits them.
        let me = self.cell.id.clone();
        self.canceler = Some(Expr::Sync(Box::new(move || {
            let cause = DynCause::interrupt(me);
            left_cell.send(FiberMessage::Interrupt(cause.clone()));
            right_cell.send(FiberMessage::Interrupt(cause));
            erase(())
        })));
        self.current = None;
    }

    /// Handles a terminal exit. If live children remain they are
    /// interrupted and awaited first (the exit is replayed afterwards);
    /// otherwise the fiber settles now. Returns true when fully settled.
    fn finish(&mut self, exit: DynExit) -> bool {
        let live: Vec<Arc<FiberCell>> = self
            .children
            .drain(..)
            .filter_map(|w| w.upgrade())
            .filter(|c| c.poll().is_none())
            .collect();
        if live.is_empty() {
            self.settle(exit);
            return true;
        }

        let interrupter = DynCause::interrupt(self.cell.id.clone());
        for child in &live {
            child.send(FiberMessage::Interrupt(interrupter.clone()));
        }

        let epoch = self.cell.allocate_epoch();
        self.awaited_epoch = epoch;
        let handle = ResumeHandle::new(Arc::clone(&self.cell), epoch);
        let remaining = Arc::new(AtomicUsize::new(live.len()));
        let slot = Arc::new(Mutex::new(Some(exit)));
        for child in live {
            let handle = handle.clone();
            let remaining = Arc::clone(&remaining);
            let slot = Arc::clone(&slot);
            child.observe(Box::new(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(exit) = slot.lock().take() {
                        handle.resume(Expr::from_exit(exit));
                    }
                }
            }));
        }
        // Teardown is terminal; a late interrupt must not cut it short.
        self.flags = self.flags.disable(RuntimeFlags::INTERRUPTION);
        self.current = None;
        false
    }

    /// Records the exit on the cell and notifies observers and the
    /// supervisor. A failure nobody observed is reported.
    fn settle(&mut self, exit: DynExit) {
        if self.flags.op_supervision() {
            self.supervisor().on_end(self.id(), &exit);
        }
        let refs = std::mem::take(&mut self.fiber_refs);
        let id = self.cell.id.clone();
        tracing::trace!(fiber = %id, success = exit.is_success(), "fiber settled");
        let observed = self.cell.complete(exit.clone(), refs);
        if observed == 0 {
            if let DynExit::Failure(cause) = &exit {
                if !cause.is_interrupted_only() {
                    self.executor.report_failure(&id, cause);
                }
            }
        }
    }

    fn supervisor(&self) -> Supervisor {
        unerase::<Supervisor>(
            self.fiber_refs
                .get(&crate::context::current_supervisor().erased),
        )
    }
}

impl std::fmt::Debug for FiberRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberRuntime")
            .field("id", &self.cell.id)
            .field("flags", &self.flags)
            .field("stack_depth", &self.stack.len())
            .field("interrupting", &self.interrupting)
            .finish()
    }
}

/// Runs a continuation, converting a panic into a defect cause.
fn catching(f: impl FnOnce() -> Expr) -> Expr {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(expr) => expr,
        Err(payload) => Expr::FailCause(DynCause::die(Defect::from_panic(payload))),
    }
}

fn catch_finalizer(finalizer: FinalizerFn, exit: &DynExit) -> Expr {
    match panic::catch_unwind(AssertUnwindSafe(move || finalizer(exit))) {
        Ok(expr) => expr,
        Err(payload) => Expr::FailCause(DynCause::die(Defect::from_panic(payload))),
    }
}

/// Wraps a finalizer step so it runs in wind-down mode, then replays the
/// original exit; a failing finalizer's cause is sequenced after the
/// original one.
fn after_finalizer(step: Expr, exit: DynExit) -> Expr {
    let replay = exit.clone();
    Expr::FlagsRegion {
        patch: FlagsPatch::enable(RuntimeFlags::WIND_DOWN),
        body: Box::new(Expr::FoldCause(
            Box::new(step),
            Box::new(move |_| Expr::from_exit(replay)),
            Box::new(move |finalizer_cause| match exit {
                DynExit::Success(_) => Expr::FailCause(finalizer_cause),
                DynExit::Failure(original) => Expr::FailCause(original.then(finalizer_cause)),
            }),
        )),
    }
}
