//! The runtime: configuration, the worker pool, and the blocking entry
//! point that turns an [`Effect`] into an [`Exit`].

pub(crate) mod executor;

use crate::cause::Cause;
use crate::context::{Environment, FiberRefs};
use crate::effect::value::{AnyValue, Data};
use crate::effect::Effect;
use crate::exit::{DynExit, Exit};
use crate::fiber::flags::RuntimeFlags;
use crate::fiber::FiberId;
use crate::services::clock::{ClockService, WallClock};
use crate::services::logger::{LogSink, LoggerService, TracingSink};
use crate::services::random::RandomService;
use executor::{Executor, FailureReporter};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Builder for a [`Runtime`].
pub struct RuntimeConfig {
    worker_threads: usize,
    op_budget: u32,
    clock: Option<ClockService>,
    log_sink: Option<Arc<dyn LogSink>>,
    random_seed: Option<u64>,
    report_failure: Option<FailureReporter>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            op_budget: 2048,
            clock: None,
            log_sink: None,
            random_seed: None,
            report_failure: None,
        }
    }
}

fn report_via_tracing(fiber: &FiberId, cause: &Cause<AnyValue>) {
    let defects: Vec<&str> = cause.defects().iter().map(|d| d.message()).collect();
    tracing::error!(
        fiber = %fiber,
        failures = cause.failures().len(),
        ?defects,
        "fiber failed and nobody observed its exit"
    );
}

impl RuntimeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker threads; zero means available parallelism.
    #[must_use]
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    /// Operations a fiber may run before it must yield.
    #[must_use]
    pub fn op_budget(mut self, budget: u32) -> Self {
        self.op_budget = budget.max(1);
        self
    }

    /// The clock service; defaults to the wall clock. Tests pass a
    /// [`VirtualClock`](crate::services::clock::VirtualClock) here.
    #[must_use]
    pub fn clock(mut self, clock: ClockService) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Where log effects go; defaults to the `tracing` ecosystem.
    #[must_use]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Fixes the random service's seed for reproducible runs.
    #[must_use]
    pub fn random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    /// Called for a fiber that fails with nobody observing its exit.
    /// Defaults to a `tracing` error event. Interruption is never
    /// reported.
    #[must_use]
    pub fn report_failure(
        mut self,
        hook: impl Fn(&FiberId, &Cause<AnyValue>) + Send + Sync + 'static,
    ) -> Self {
        self.report_failure = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn build(self) -> Runtime {
        let clock = self
            .clock
            .unwrap_or_else(|| ClockService(Arc::new(WallClock::new())));
        let logger = LoggerService(self.log_sink.unwrap_or_else(|| Arc::new(TracingSink)));
        let random = match self.random_seed {
            Some(seed) => RandomService::seeded(seed),
            None => RandomService::from_entropy(),
        };
        let environment = Environment::empty()
            .add(clock.clone())
            .add(logger)
            .add(random);
        let threads = if self.worker_threads == 0 {
            std::thread::available_parallelism().map_or(4, usize::from)
        } else {
            self.worker_threads
        };
        let reporter = self
            .report_failure
            .unwrap_or_else(|| Arc::new(report_via_tracing));
        Runtime {
            executor: Executor::start(threads.max(1), clock, self.op_budget, reporter),
            environment,
        }
    }
}

/// Owns the worker pool and the base environment. Dropping the runtime
/// shuts the pool down.
pub struct Runtime {
    executor: Arc<Executor>,
    environment: Environment,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// A runtime with default configuration: wall clock, `tracing` logging,
    /// entropy-seeded randomness.
    #[must_use]
    pub fn new() -> Self {
        RuntimeConfig::default().build()
    }

    /// The base environment every root fiber starts with.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Runs an effect to completion on a fresh root fiber, blocking the
    /// calling thread until it exits.
    pub fn run<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let env = self.environment.clone();
        let wrapped = crate::context::current_environment()
            .set(env)
            .widen_error::<E>()
            .flat_map(move |()| effect);
        let cell = self.executor.spawn(
            self.executor.next_fiber_id(),
            wrapped.into_expr(),
            FiberRefs::new(),
            RuntimeFlags::default_set(),
        );

        let gate = Arc::new((Mutex::new(None::<DynExit>), Condvar::new()));
        let signal = Arc::clone(&gate);
        cell.observe(Box::new(move |exit| {
            *signal.0.lock() = Some(exit);
            signal.1.notify_all();
        }));

        let mut slot = gate.0.lock();
        loop {
            if let Some(exit) = slot.take() {
                return exit.typed::<A, E>();
            }
            gate.1.wait(&mut slot);
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.executor.shutdown();
    }
}
