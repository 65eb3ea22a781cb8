// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The scavengeable table of live promises. See [`PromiseRegistry`].

use std::sync::{Mutex, Weak};

use super::PromiseInner;

/// A weak reference into the registry: `(slot index, generation)`.
///
/// The generation disambiguates slot reuse: two promises that lived in the
/// same recycled slot carry distinct pairs, so a stale pair never aliases a
/// stranger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryRef {
    index: usize,
    generation: u64,
}

impl RegistryRef {
    /// The slot index.
    #[must_use]
    pub fn index(&self) -> usize { self.index }

    /// The slot's incarnation when this reference was handed out.
    #[must_use]
    pub fn generation(&self) -> u64 { self.generation }
}

/// Tracks every live promise of a loop so termination can reject the
/// still-pending ones.
///
/// # Structure
///
/// A slot table where each slot is `(generation, Option<Weak<…>>)` plus a
/// free list. Handing out an `(index, generation)` pair acts as a weak
/// reference without cyclic ownership: the registry never keeps a promise
/// alive.
///
/// # Scavenging
///
/// [`scavenge`] walks a bounded batch of slots from a persistent cursor and
/// reclaims those whose weak reference has lapsed, so reclamation cost per
/// call stays constant regardless of table size. The loop runs a batch
/// opportunistically between ticks.
///
/// [`scavenge`]: Self::scavenge
#[derive(Debug, Default)]
pub struct PromiseRegistry {
    slots: Mutex<SlotTable>,
}

#[derive(Debug, Default)]
struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    cursor: usize,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    entry: Option<Weak<PromiseInner>>,
}

impl PromiseRegistry {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Registers a promise; returns its weak reference.
    pub fn insert(&self, promise: Weak<PromiseInner>) -> RegistryRef {
        let mut table = self.lock();
        match table.free.pop() {
            Some(index) => {
                let slot = &mut table.slots[index];
                slot.generation += 1;
                slot.entry = Some(promise);
                RegistryRef { index, generation: slot.generation }
            }
            None => {
                let index = table.slots.len();
                table.slots.push(Slot { generation: 1, entry: Some(promise) });
                RegistryRef { index, generation: 1 }
            }
        }
    }

    /// Reclaims up to `batch` slots whose promises have been dropped.
    /// Returns the number reclaimed.
    pub fn scavenge(&self, batch: usize) -> usize {
        let mut table = self.lock();
        let len = table.slots.len();
        if len == 0 {
            return 0;
        }
        let mut reclaimed = 0;
        let mut cursor = table.cursor % len;
        for _ in 0..batch.min(len) {
            let slot = &mut table.slots[cursor];
            if let Some(weak) = slot.entry.as_ref()
                && weak.strong_count() == 0
            {
                slot.entry = None;
                table.free.push(cursor);
                reclaimed += 1;
            }
            cursor = (cursor + 1) % len;
        }
        table.cursor = cursor;
        reclaimed
    }

    /// Upgrades every live entry. Used by the terminal sweep to reject
    /// still-pending promises.
    #[must_use]
    pub fn live_promises(&self) -> Vec<std::sync::Arc<PromiseInner>> {
        let table = self.lock();
        table
            .slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter_map(std::sync::Weak::upgrade)
            .collect()
    }

    /// Number of occupied slots (live or lapsed-but-unreclaimed).
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.entry.is_some()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotTable> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
