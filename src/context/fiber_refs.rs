//! The per-fiber map of fiber-ref values, with fork/join reconciliation.
//!
//! Each entry keeps a stack of `(owning fiber, value, version)` frames. The
//! stack records which ancestor last wrote the value, so when a child fiber
//! is joined we can locate the nearest common ancestor value shared by the
//! parent's and the child's stacks, diff the child's final value against it,
//! and apply that patch to the parent's *current* value. Concurrent,
//! divergent local updates merge instead of last-writer-wins.

use crate::context::fiber_ref::ErasedFiberRef;
use crate::effect::value::AnyValue;
use crate::fiber::FiberId;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
struct StackFrame {
    owner: FiberId,
    value: AnyValue,
    version: u64,
}

#[derive(Clone)]
struct RefEntry {
    reference: Arc<ErasedFiberRef>,
    /// Newest frame last. Entries are never empty.
    stack: SmallVec<[StackFrame; 2]>,
}

/// All fiber-ref values visible to one fiber.
#[derive(Clone, Default)]
pub struct FiberRefs {
    entries: HashMap<u64, RefEntry>,
}

impl FiberRefs {
    /// An empty map; every ref reads its initial value.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current value for `reference`, falling back to its initial value.
    pub(crate) fn get(&self, reference: &Arc<ErasedFiberRef>) -> AnyValue {
        match self.entries.get(&reference.id) {
            Some(entry) => entry
                .stack
                .last()
                .map_or_else(|| reference.initial.clone(), |f| f.value.clone()),
            None => reference.initial.clone(),
        }
    }

    /// Sets the value for `reference` on behalf of `owner`.
    ///
    /// If the top frame already belongs to `owner` the frame is replaced in
    /// place with a bumped version; otherwise a new frame is pushed.
    pub(crate) fn set(
        &mut self,
        owner: &FiberId,
        reference: &Arc<ErasedFiberRef>,
        value: AnyValue,
    ) {
        let entry = self
            .entries
            .entry(reference.id)
            .or_insert_with(|| RefEntry {
                reference: Arc::clone(reference),
                stack: SmallVec::new(),
            });
        match entry.stack.last_mut() {
            Some(top) if top.owner == *owner => {
                top.value = value;
                top.version += 1;
            }
            Some(top) => {
                let version = top.version + 1;
                entry.stack.push(StackFrame {
                    owner: owner.clone(),
                    value,
                    version,
                });
            }
            None => entry.stack.push(StackFrame {
                owner: owner.clone(),
                value,
                version: 0,
            }),
        }
    }

    /// The view a newly-forked child starts with: each ref's fork patch is
    /// applied to the parent's current value (identity forks share the
    /// parent's stack unchanged).
    #[must_use]
    pub(crate) fn forked(&self, child: &FiberId) -> FiberRefs {
        let mut entries = HashMap::with_capacity(self.entries.len());
        for (id, entry) in &self.entries {
            match &entry.reference.fork {
                None => {
                    entries.insert(*id, entry.clone());
                }
                Some(fork_patch) => {
                    let current = entry
                        .stack
                        .last()
                        .map_or_else(|| entry.reference.initial.clone(), |f| f.value.clone());
                    let seeded = (entry.reference.patch)(fork_patch, &current);
                    let mut stack = entry.stack.clone();
                    let version = stack.last().map_or(0, |f| f.version + 1);
                    stack.push(StackFrame {
                        owner: child.clone(),
                        value: seeded,
                        version,
                    });
                    entries.insert(
                        *id,
                        RefEntry {
                            reference: Arc::clone(&entry.reference),
                            stack,
                        },
                    );
                }
            }
        }
        FiberRefs { entries }
    }

    /// Merges a completed child's refs into this (parent) map.
    ///
    /// For every ref the child touched: find the nearest common ancestor
    /// value between the two stacks, diff the child's final value against
    /// it, apply the patch to the parent's current value, then run the
    /// ref's `join` step.
    pub(crate) fn join_child(&mut self, self_id: &FiberId, child: &FiberRefs) {
        for (id, child_entry) in &child.entries {
            let Some(child_top) = child_entry.stack.last() else {
                continue;
            };
            let reference = Arc::clone(&child_entry.reference);
            let parent_stack: &[StackFrame] = self
                .entries
                .get(id)
                .map_or(&[], |entry| entry.stack.as_slice());
            let ancestor = find_ancestor(&reference, parent_stack, &child_entry.stack);
            let patch = (reference.diff)(&ancestor, &child_top.value);
            let parent_current = self.get(&reference);
            let patched = (reference.patch)(&patch, &parent_current);
            let joined = (reference.join)(&parent_current, &patched);
            self.set(self_id, &reference, joined);
        }
    }

    /// Number of refs with at least one recorded value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no ref has a recorded value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Walks both stacks newest-first, discarding the frame belonging to the
/// younger fiber (by `(started_at, seq)` order) until a frame written by the
/// same fiber at the same version appears in both; that value is the nearest
/// common ancestor. Falls back to the ref's initial value.
fn find_ancestor(
    reference: &ErasedFiberRef,
    parent: &[StackFrame],
    child: &[StackFrame],
) -> AnyValue {
    let mut p = parent.len();
    let mut c = child.len();
    while p > 0 && c > 0 {
        let pf = &parent[p - 1];
        let cf = &child[c - 1];
        if pf.owner == cf.owner {
            if pf.version == cf.version {
                return pf.value.clone();
            }
            if pf.version > cf.version {
                p -= 1;
            } else {
                c -= 1;
            }
        } else if cf.owner.is_younger_than(&pf.owner) {
            c -= 1;
        } else {
            p -= 1;
        }
    }
    reference.initial.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fiber_ref::FiberRef;
    use crate::effect::value::{erase, unerase};
    use crate::services::clock::Timestamp;

    fn fid(seq: u64) -> FiberId {
        FiberId::Gen {
            seq,
            started_at: Timestamp::ZERO,
        }
    }

    fn get_typed<V: crate::effect::value::Data>(refs: &FiberRefs, r: &FiberRef<V, V>) -> V {
        unerase::<V>(refs.get(&r.erased))
    }

    #[test]
    fn unset_ref_reads_initial() {
        let refs = FiberRefs::new();
        let r = FiberRef::new(41_u32);
        assert_eq!(get_typed(&refs, &r), 41);
    }

    #[test]
    fn set_then_get() {
        let mut refs = FiberRefs::new();
        let r = FiberRef::new(0_u32);
        refs.set(&fid(1), &r.erased, erase(7_u32));
        assert_eq!(get_typed(&refs, &r), 7);
    }

    #[test]
    fn join_applies_child_diff_to_parent_current() {
        // Counter ref with additive patches: parent and child increment
        // concurrently; the join must preserve both increments.
        let r = FiberRef::with_patch(
            0_i64,
            None,
            |old: &i64, new: &i64| new - old,
            |a: &i64, b: &i64| a + b,
            |p: &i64, old: &i64| old + p,
        );
        let parent = fid(1);
        let child = fid(2);

        let mut parent_refs = FiberRefs::new();
        parent_refs.set(&parent, &r.erased, erase(10_i64));

        let mut child_refs = parent_refs.forked(&child);
        // Child adds 5.
        child_refs.set(&child, &r.erased, erase(15_i64));
        // Parent concurrently adds 100.
        parent_refs.set(&parent, &r.erased, erase(110_i64));

        parent_refs.join_child(&parent, &child_refs);
        // diff(ancestor=10, child=15) = +5 applied to parent current 110.
        assert_eq!(unerase::<i64>(parent_refs.get(&r.erased)), 115);
    }

    #[test]
    fn join_of_untouched_child_is_noop() {
        let parent = fid(1);
        let child = fid(2);
        // Child never writes: diff(ancestor, child) is the zero patch, so
        // the parent's concurrent update survives the join.
        let counter = FiberRef::with_patch(
            0_i64,
            None,
            |old: &i64, new: &i64| new - old,
            |a: &i64, b: &i64| a + b,
            |p: &i64, old: &i64| old + p,
        );
        let mut parent_refs = FiberRefs::new();
        parent_refs.set(&parent, &counter.erased, erase(10_i64));
        let child_refs = parent_refs.forked(&child);
        parent_refs.set(&parent, &counter.erased, erase(50_i64));
        parent_refs.join_child(&parent, &child_refs);
        assert_eq!(unerase::<i64>(parent_refs.get(&counter.erased)), 50);
    }

    #[test]
    fn fork_reset_seeds_child_value() {
        let r = FiberRef::new_fork_reset(vec![1_u8, 2], Vec::new());
        let parent = fid(1);
        let child = fid(2);
        let mut parent_refs = FiberRefs::new();
        parent_refs.set(&parent, &r.erased, erase(vec![1_u8, 2]));
        let child_refs = parent_refs.forked(&child);
        assert_eq!(unerase::<Vec<u8>>(child_refs.get(&r.erased)), Vec::<u8>::new());
        // Parent keeps its own view.
        assert_eq!(
            unerase::<Vec<u8>>(parent_refs.get(&r.erased)),
            vec![1_u8, 2]
        );
    }
}
