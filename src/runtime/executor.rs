//! The worker pool that drives fibers.
//!
//! A single injector queue feeds a fixed set of worker threads. Workers
//! claim a fiber's interpreter state from its cell, run one slice, and
//! either requeue it (yield), park it on the cell (suspension), or let it
//! go (done). Fibers are rescheduled by their own cells through the
//! schedule hook installed at spawn, so wakers need no reference to the
//! executor type.

use crate::cause::DynCause;
use crate::context::FiberRefs;
use crate::effect::Expr;
use crate::fiber::cell::{FiberCell, FiberStatus};
use crate::fiber::flags::RuntimeFlags;
use crate::fiber::runtime::{FiberRuntime, StepOutcome};
use crate::fiber::FiberId;
use crate::services::clock::ClockService;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Called when a fiber fails and nothing observed its exit.
pub(crate) type FailureReporter = Arc<dyn Fn(&FiberId, &DynCause) + Send + Sync>;

pub(crate) struct Executor {
    injector: Mutex<VecDeque<Arc<FiberCell>>>,
    work_available: Condvar,
    shutting_down: AtomicBool,
    clock: ClockService,
    op_budget: u32,
    reporter: FailureReporter,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    pub(crate) fn start(
        threads: usize,
        clock: ClockService,
        op_budget: u32,
        reporter: FailureReporter,
    ) -> Arc<Self> {
        let executor = Arc::new(Self {
            injector: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            clock,
            op_budget,
            reporter,
            workers: Mutex::new(Vec::with_capacity(threads)),
        });
        let mut workers = executor.workers.lock();
        for i in 0..threads {
            let exec = Arc::clone(&executor);
            let handle = std::thread::Builder::new()
                .name(format!("filament-worker-{i}"))
                .spawn(move || exec.worker_loop())
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        drop(workers);
        executor
    }

    /// Reports a failure nobody observed.
    pub(crate) fn report_failure(&self, fiber: &FiberId, cause: &DynCause) {
        (self.reporter)(fiber, cause);
    }

    /// Allocates a fiber id stamped with the current clock time.
    pub(crate) fn next_fiber_id(&self) -> FiberId {
        FiberId::next(self.clock.0.now())
    }

    /// Creates a fiber and queues its first slice.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        id: FiberId,
        expr: Expr,
        refs: FiberRefs,
        flags: RuntimeFlags,
    ) -> Arc<FiberCell> {
        let exec = Arc::clone(self);
        let cell = FiberCell::new(id, Box::new(move |woken| exec.schedule(woken)));
        let rt = FiberRuntime::new(
            Arc::clone(&cell),
            expr,
            refs,
            flags,
            Arc::clone(self),
            self.op_budget,
        );
        cell.store_runtime(Box::new(rt));
        self.schedule(Arc::clone(&cell));
        cell
    }

    pub(crate) fn schedule(&self, cell: Arc<FiberCell>) {
        self.injector.lock().push_back(cell);
        self.work_available.notify_one();
    }

    fn next_task(&self) -> Option<Arc<FiberCell>> {
        let mut queue = self.injector.lock();
        loop {
            if let Some(cell) = queue.pop_front() {
                return Some(cell);
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return None;
            }
            self.work_available.wait(&mut queue);
        }
    }

    fn worker_loop(self: Arc<Self>) {
        while let Some(cell) = self.next_task() {
            // Another worker may hold the state (stale double-schedule) or
            // the fiber may be done; both mean just move on.
            let Some(mut rt) = cell.take_runtime() else {
                continue;
            };
            match rt.run() {
                StepOutcome::Yielded => {
                    cell.store_runtime(rt);
                    self.schedule(cell);
                }
                StepOutcome::Suspended => {
                    cell.store_runtime(rt);
                    // A resume may have raced the park and found nothing to
                    // run; if the cell was woken meanwhile, requeue it.
                    if cell.status() == FiberStatus::Running {
                        self.schedule(cell);
                    }
                }
                StepOutcome::Done => {}
            }
        }
    }

    /// Stops accepting work and joins the workers. Queued fibers that have
    /// not started are dropped.
    pub(crate) fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.work_available.notify_all();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}
