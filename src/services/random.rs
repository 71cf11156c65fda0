//! The ambient random service.
//!
//! Wraps a seeded [`SplitMix64`] behind a lock so effects share one stream.
//! The default runtime seeds from the wall clock; tests provide a fixed seed
//! for reproducible runs.

use crate::effect::value::Never;
use crate::effect::{service, Effect};
use crate::util::rng::SplitMix64;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A shared source of pseudo-randomness.
#[derive(Clone)]
pub struct RandomService {
    rng: Arc<Mutex<SplitMix64>>,
}

impl RandomService {
    /// A service with a fixed seed; the stream is reproducible.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(SplitMix64::new(seed))),
        }
    }

    /// A service seeded from the wall clock.
    #[must_use]
    pub fn from_entropy() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x5eed);
        Self::seeded(nanos)
    }

    pub fn next_u64(&self) -> u64 {
        self.rng.lock().next_u64()
    }

    pub fn next_f64(&self) -> f64 {
        self.rng.lock().next_f64()
    }

    pub fn next_bool(&self) -> bool {
        self.rng.lock().next_bool()
    }

    /// A value in `[0, bound)`; panics if `bound` is zero.
    pub fn next_bounded(&self, bound: u64) -> u64 {
        self.rng.lock().next_bounded(bound)
    }

    pub fn fill_bytes(&self, dest: &mut [u8]) {
        self.rng.lock().fill_bytes(dest);
    }
}

impl std::fmt::Debug for RandomService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RandomService")
    }
}

/// The next pseudo-random `u64` from the ambient service.
pub fn random_u64() -> Effect<u64, Never> {
    service::<RandomService>().or_die().map(|r| r.next_u64())
}

/// The next pseudo-random `f64` in `[0, 1)`.
pub fn random_f64() -> Effect<f64, Never> {
    service::<RandomService>().or_die().map(|r| r.next_f64())
}

/// A pseudo-random `u64` in `[0, bound)`; dies if `bound` is zero.
pub fn random_bounded(bound: u64) -> Effect<u64, Never> {
    service::<RandomService>()
        .or_die()
        .map(move |r| r.next_bounded(bound))
}
