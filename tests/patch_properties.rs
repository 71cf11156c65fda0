//! Patch Algebra Property Suite
//!
//! Property tests for the diff/patch pairs used to reconcile fiber
//! context at join: applying `diff(old, new)` to `old` must always land
//! on `new`, and composed patches must apply in order.

use filament::{Environment, FlagsPatch, RuntimeFlags, Supervise, Supervisor};
use proptest::prelude::*;

fn flags_from_bits(bits: u8) -> RuntimeFlags {
    let mut flags = RuntimeFlags::none();
    if bits & 1 != 0 {
        flags = flags.enable(RuntimeFlags::INTERRUPTION);
    }
    if bits & 2 != 0 {
        flags = flags.enable(RuntimeFlags::COOPERATIVE_YIELDING);
    }
    if bits & 4 != 0 {
        flags = flags.enable(RuntimeFlags::OP_SUPERVISION);
    }
    if bits & 8 != 0 {
        flags = flags.enable(RuntimeFlags::WIND_DOWN);
    }
    flags
}

#[derive(Clone)]
struct Alpha(u64);
#[derive(Clone)]
struct Beta(u64);
#[derive(Clone)]
struct Gamma(u64);

type EnvSpec = (Option<u64>, Option<u64>, Option<u64>);

fn env_from(spec: EnvSpec) -> Environment {
    let mut env = Environment::empty();
    if let Some(v) = spec.0 {
        env = env.add(Alpha(v));
    }
    if let Some(v) = spec.1 {
        env = env.add(Beta(v));
    }
    if let Some(v) = spec.2 {
        env = env.add(Gamma(v));
    }
    env
}

fn env_spec() -> impl Strategy<Value = EnvSpec> {
    (
        prop::option::of(any::<u64>()),
        prop::option::of(any::<u64>()),
        prop::option::of(any::<u64>()),
    )
}

struct Silent;

impl Supervise for Silent {}

/// Builds a supervisor from a subset of a shared pool of hooks.
fn supervisor_from(pool: &[Supervisor], mask: u8) -> Supervisor {
    let mut combined = Supervisor::none();
    for (index, leaf) in pool.iter().enumerate() {
        if mask & (1 << index) != 0 {
            combined = combined.zip(leaf);
        }
    }
    combined
}

proptest! {
    #[test]
    fn flags_diff_then_patch_reaches_target(a in 0u8..16, b in 0u8..16) {
        let old = flags_from_bits(a);
        let new = flags_from_bits(b);
        prop_assert_eq!(old.patch(old.diff(new)), new);
    }

    #[test]
    fn flags_patch_composition_applies_in_order(a in 0u8..16, b in 0u8..16, c in 0u8..16) {
        let first = flags_from_bits(a);
        let second = flags_from_bits(b);
        let third = flags_from_bits(c);
        let composed = first.diff(second).and_then(second.diff(third));
        prop_assert_eq!(first.patch(composed), third);
    }

    #[test]
    fn empty_flags_patch_changes_nothing(a in 0u8..16) {
        let flags = flags_from_bits(a);
        prop_assert_eq!(flags.patch(FlagsPatch::empty()), flags);
        prop_assert!(flags.diff(flags).is_empty());
    }

    #[test]
    fn environment_diff_then_apply_reaches_target(old in env_spec(), new in env_spec()) {
        let old_env = env_from(old);
        let new_env = env_from(new);
        let patched = Environment::diff(&old_env, &new_env).apply(&old_env);
        prop_assert!(patched.eq_by_identity(&new_env));
    }

    #[test]
    fn environment_self_diff_is_identity(spec in env_spec()) {
        let env = env_from(spec);
        let patched = Environment::diff(&env, &env).apply(&env);
        prop_assert!(patched.eq_by_identity(&env));
    }

    #[test]
    fn supervisor_diff_then_apply_reaches_target(old_mask in 0u8..8, new_mask in 0u8..8) {
        let pool = [
            Supervisor::new(Silent),
            Supervisor::new(Silent),
            Supervisor::new(Silent),
        ];
        let old = supervisor_from(&pool, old_mask);
        let new = supervisor_from(&pool, new_mask);
        let patched = Supervisor::diff(&old, &new).apply(&old);
        prop_assert!(patched.same_supervisors(&new));
    }
}
