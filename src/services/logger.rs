//! Structured, fiber-aware logging.
//!
//! Log statements are effects: they read the ambient [`LoggerService`], the
//! current fiber's log spans and annotations (both fiber refs, so they
//! propagate into children on fork), and emit a [`LogEvent`] to the
//! configured [`LogSink`]. The default runtime installs [`TracingSink`],
//! which forwards to the `tracing` ecosystem; tests use [`MemorySink`] to
//! assert on captured events.

use crate::context::environment::Environment;
use crate::effect::value::{unerase, Data, Never};
use crate::effect::{Effect, Expr};
use crate::fiber::FiberId;
use crate::services::clock::{ClockService, Timestamp};
use core::fmt;
use parking_lot::Mutex;
use std::sync::Arc;

/// Severity of a log event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A named region a log event occurred within.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSpan {
    /// The span's label.
    pub label: String,
    /// When the span was opened.
    pub started_at: Timestamp,
}

/// One structured log event.
#[derive(Clone, Debug)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    /// The fiber that logged.
    pub fiber: FiberId,
    pub timestamp: Timestamp,
    /// Open spans, outermost first.
    pub spans: Vec<LogSpan>,
    /// Key/value annotations in force, insertion order.
    pub annotations: Vec<(String, String)>,
}

/// Destination for log events.
pub trait LogSink: Send + Sync {
    fn log(&self, event: &LogEvent);
}

/// The ambient logging service.
#[derive(Clone)]
pub struct LoggerService(pub Arc<dyn LogSink>);

impl fmt::Debug for LoggerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoggerService")
    }
}

/// Forwards events to the `tracing` ecosystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, event: &LogEvent) {
        let spans = event
            .spans
            .iter()
            .map(|s| s.label.as_str())
            .collect::<Vec<_>>()
            .join(">");
        match event.level {
            LogLevel::Trace => tracing::trace!(
                fiber = %event.fiber, %spans, annotations = ?event.annotations, "{}", event.message
            ),
            LogLevel::Debug => tracing::debug!(
                fiber = %event.fiber, %spans, annotations = ?event.annotations, "{}", event.message
            ),
            LogLevel::Info => tracing::info!(
                fiber = %event.fiber, %spans, annotations = ?event.annotations, "{}", event.message
            ),
            LogLevel::Warn => tracing::warn!(
                fiber = %event.fiber, %spans, annotations = ?event.annotations, "{}", event.message
            ),
            LogLevel::Error => tracing::error!(
                fiber = %event.fiber, %spans, annotations = ?event.annotations, "{}", event.message
            ),
        }
    }
}

/// Captures events in memory, for tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything logged so far.
    #[must_use]
    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }
}

impl LogSink for MemorySink {
    fn log(&self, event: &LogEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Logs `message` at `level` with the current fiber's spans and
/// annotations. A no-op if no [`LoggerService`] is in the environment.
pub fn log(level: LogLevel, message: impl Into<String>) -> Effect<(), Never> {
    let message = message.into();
    Effect::from_expr(Expr::Stateful(Box::new(move |rt| {
        let env = unerase::<Environment>(
            rt.fiber_refs
                .get(&crate::context::current_environment().erased),
        );
        if let Ok(logger) = env.get::<LoggerService>() {
            let timestamp = env
                .get::<ClockService>()
                .map(|c| c.0.now())
                .unwrap_or(Timestamp::ZERO);
            let spans = unerase::<Vec<LogSpan>>(
                rt.fiber_refs.get(&crate::context::log_spans().erased),
            );
            let annotations = unerase::<Vec<(String, String)>>(
                rt.fiber_refs.get(&crate::context::log_annotations().erased),
            );
            logger.0.log(&LogEvent {
                level,
                message,
                fiber: rt.id().clone(),
                timestamp,
                spans,
                annotations,
            });
        }
        Expr::unit()
    })))
}

/// Runs `effect` inside a named log span; events logged within carry it.
pub fn log_span<A: Data, E: Data>(
    label: impl Into<String>,
    effect: Effect<A, E>,
) -> Effect<A, E> {
    let label = label.into();
    let spans_ref = crate::context::log_spans().clone();
    let restore = spans_ref.clone();
    spans_ref.get().widen_error::<E>().flat_map(move |mut spans| {
        Effect::environment().widen_error::<E>().flat_map(move |env| {
            let started_at = env
                .get::<ClockService>()
                .map(|c| c.0.now())
                .unwrap_or(Timestamp::ZERO);
            spans.push(LogSpan { label, started_at });
            restore.locally(spans, effect)
        })
    })
}

/// Runs `effect` with an extra log annotation in force.
pub fn log_annotated<A: Data, E: Data>(
    key: impl Into<String>,
    value: impl Into<String>,
    effect: Effect<A, E>,
) -> Effect<A, E> {
    let key = key.into();
    let value = value.into();
    let annotations_ref = crate::context::log_annotations().clone();
    let restore = annotations_ref.clone();
    annotations_ref
        .get()
        .widen_error::<E>()
        .flat_map(move |mut annotations| {
            annotations.retain(|(k, _)| *k != key);
            annotations.push((key, value));
            restore.locally(annotations, effect)
        })
}
