//! Ambient services provided through the environment.

pub mod clock;
pub mod logger;
pub mod random;

pub use clock::{Clock, ClockService, Timestamp, VirtualClock, WallClock};
pub use logger::{log, log_annotated, log_span, LogEvent, LogLevel, LogSink, LogSpan, LoggerService, MemorySink, TracingSink};
pub use random::{random_bounded, random_f64, random_u64, RandomService};
