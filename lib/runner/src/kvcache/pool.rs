// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::errors::KvCacheGrowError;
use super::grow::{GrowthController, Reservation};
use super::slot::{CacheSlot, SlotId};
use crate::stats::RunnerStats;

/// Fixed set of cache slots shared by all sequences of a runner.
///
/// Every mutation (assign, grow, commit, release) happens under one lock, so a
/// slot is either owned by exactly one sequence or sitting free, never both.
/// Stats readers take the same lock only long enough to compute a snapshot.
pub struct SlotPool {
    slots: Mutex<Vec<CacheSlot>>,
    generation: AtomicU64,
    growth: GrowthController,
    max_cells: usize,
}

impl SlotPool {
    pub fn new(
        num_slots: usize,
        initial_cells: usize,
        max_cells: usize,
        growth: GrowthController,
    ) -> Self {
        let slots = (0..num_slots)
            .map(|i| CacheSlot::new(SlotId(i), initial_cells, max_cells))
            .collect();
        Self {
            slots: Mutex::new(slots),
            generation: AtomicU64::new(0),
            growth,
            max_cells,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_cells(&self) -> usize {
        self.max_cells
    }

    /// Assign the least recently used free slot. `None` when all slots are taken.
    pub fn acquire(&self) -> Option<SlotId> {
        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .filter(|slot| !slot.is_active())
            .min_by_key(|slot| slot.last_assigned())?;
        slot.assign(self.generation.fetch_add(1, Ordering::Relaxed) + 1);
        Some(slot.id())
    }

    /// Return a slot to the free pool. Releasing a free or unknown slot is a no-op.
    pub fn release(&self, id: SlotId) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(id.0) {
            Some(slot) => slot.release(),
            None => false,
        }
    }

    /// Make room for `cells` more cells in slot `id` and record them as used.
    ///
    /// Grows the slot when the current allocation is too small. On
    /// [`Reservation::ContextFull`] nothing is recorded.
    pub fn append(&self, id: SlotId, cells: usize) -> Result<Reservation, KvCacheGrowError> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(id.0)
            .unwrap_or_else(|| panic!("{id} is not part of this pool"));
        assert!(slot.is_active(), "{id} appended to while free");

        let reservation = self.growth.reserve(slot, cells)?;
        if !matches!(reservation, Reservation::ContextFull { .. }) {
            slot.commit(cells);
        }
        Ok(reservation)
    }

    /// Copy of one slot's current state.
    pub fn slot(&self, id: SlotId) -> Option<CacheSlot> {
        self.slots.lock().get(id.0).cloned()
    }

    /// Point-in-time utilization computed from the current slot state.
    pub fn stats(&self) -> RunnerStats {
        let slots = self.slots.lock();
        RunnerStats::from_slots(&slots, self.max_cells)
    }
}
