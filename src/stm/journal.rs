//! The per-attempt read/write log of a transaction.

use crate::effect::value::AnyValue;
use crate::stm::tref::{TRefInner, Waiter};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct Entry {
    slot: Arc<TRefInner>,
    /// Version observed on first touch; the attempt is valid only if the
    /// live version still matches at commit time.
    expected: u64,
    current: AnyValue,
    written: bool,
}

/// A transaction attempt's private view of every ref it touched.
///
/// Reads are served from the journal after first touch, so an attempt sees
/// its own writes and a stable snapshot of everything else. Nothing is
/// visible to other fibers until [`commit`](Journal::commit) validates the
/// attempt and applies its writes atomically.
pub(crate) struct Journal {
    entries: HashMap<u64, Entry>,
}

pub(crate) type Snapshot = HashMap<u64, Entry>;

impl Journal {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn read(&mut self, slot: &Arc<TRefInner>) -> AnyValue {
        let entry = self.entries.entry(slot.id).or_insert_with(|| {
            let cell = slot.state.lock();
            Entry {
                slot: Arc::clone(slot),
                expected: cell.version,
                current: cell.value.clone(),
                written: false,
            }
        });
        entry.current.clone()
    }

    pub(crate) fn write(&mut self, slot: &Arc<TRefInner>, value: AnyValue) {
        // First touch still records the live version for validation.
        self.read(slot);
        if let Some(entry) = self.entries.get_mut(&slot.id) {
            entry.current = value;
            entry.written = true;
        }
    }

    /// The current entries, for `or_else` backtracking.
    pub(crate) fn snapshot(&self) -> Snapshot {
        self.entries.clone()
    }

    pub(crate) fn restore(&mut self, snapshot: Snapshot) {
        self.entries = snapshot;
    }

    /// Every touched ref with the version the attempt read.
    pub(crate) fn reads(&self) -> Vec<(Arc<TRefInner>, u64)> {
        self.entries
            .values()
            .map(|e| (Arc::clone(&e.slot), e.expected))
            .collect()
    }

    /// Validates the attempt under every touched ref's lock (taken in id
    /// order) and, when `apply` is set and validation passed, installs the
    /// writes as fresh versions and wakes the transactions parked on them.
    /// Returns whether the attempt was valid.
    pub(crate) fn commit(&self, apply: bool) -> bool {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.slot.id);
        let mut guards: Vec<_> = entries.iter().map(|e| e.slot.state.lock()).collect();

        let valid = entries
            .iter()
            .zip(&guards)
            .all(|(entry, cell)| entry.expected == cell.version);
        if !valid || !apply {
            return valid;
        }

        let mut woken: Vec<Arc<dyn Waiter>> = Vec::new();
        for (entry, cell) in entries.iter().zip(guards.iter_mut()) {
            if entry.written {
                cell.value = entry.current.clone();
                cell.version += 1;
                woken.extend(std::mem::take(&mut cell.todos).into_values());
            }
        }
        drop(guards);
        for waiter in woken {
            if !waiter.fired() {
                waiter.wake();
            }
        }
        true
    }
}
