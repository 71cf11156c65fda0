//! Structured-concurrency effect runtime.
//!
//! An [`Effect`] is an immutable description of a computation: nothing runs
//! until a [`Runtime`] interprets it on a fiber. Fibers are cooperatively
//! scheduled green threads with typed exits, two-channel failure (typed
//! errors and untyped defects, both carried in a [`Cause`] tree),
//! interruption that respects uninterruptible regions, and [`FiberRef`]
//! context that forks to children and reconciles at join.
//!
//! On top of the interpreter sit scoped resources ([`Scope`],
//! [`acquire_release`]), software transactional memory ([`Stm`], [`TRef`]),
//! asynchronous [`Queue`]s and broadcast [`Hub`]s, and [`Schedule`]-driven
//! repetition and retry.
//!
//! ```
//! use filament::{Effect, Exit, Runtime};
//!
//! let rt = Runtime::new();
//! let program = Effect::<u32>::succeed(20).map(|n| n * 2);
//! assert_eq!(rt.run(program), Exit::Success(40));
//! ```
//!
//! Concurrency is structured: a forked [`Fiber`] is owned by its parent and
//! is interrupted when the parent finishes without joining it.
//!
//! ```
//! use filament::{Effect, Exit, Runtime};
//!
//! let rt = Runtime::new();
//! let program = Effect::<u32>::succeed(7)
//!     .fork()
//!     .flat_map(|fiber| fiber.join());
//! assert_eq!(rt.run(program), Exit::Success(7));
//! ```

#![forbid(unsafe_code)]

pub mod cause;
pub mod context;
pub mod effect;
pub mod exit;
pub mod fiber;
pub mod queue;
pub mod runtime;
pub mod schedule;
pub mod scope;
pub mod services;
pub mod stm;
pub mod supervisor;
pub mod sync;
pub mod util;

pub use cause::{Cause, Defect};
pub use context::{Environment, EnvironmentPatch, FiberRef, ServiceNotFound};
pub use effect::{
    acquire_release, forever, service, AnyValue, AsyncCallback, Data, Effect, Never,
};
pub use exit::Exit;
pub use fiber::flags::{FlagsPatch, RuntimeFlags};
pub use fiber::{Fiber, FiberDump, FiberId, FiberStatus};
pub use queue::{Hub, Queue, Subscription};
pub use runtime::{Runtime, RuntimeConfig};
pub use schedule::{repeat, retry, Decision, Driver, Interval, NoMoreRecurrences, Schedule};
pub use scope::{scoped, ExecutionStrategy, Scope, ScopeExit};
pub use services::{Clock, ClockService, Timestamp, VirtualClock, WallClock};
pub use stm::{atomically, Stm, TRef};
pub use supervisor::{ProxyHandle, Supervise, Supervisor, SupervisorPatch};
pub use sync::{Deferred, Ref};
