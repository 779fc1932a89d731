// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a cache slot within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// KV cache footprint of exactly one sequence.
///
/// `used_cells <= allocated_cells <= max_cells` holds at all times. Allocation
/// only ever grows; `used_cells` is reset when the slot is handed to a new
/// sequence.
#[derive(Debug, Clone)]
pub struct CacheSlot {
    id: SlotId,
    initial_cells: usize,
    allocated_cells: usize,
    used_cells: usize,
    max_cells: usize,
    active: bool,
    // assignment counter value of the last assign, 0 if never assigned
    last_assigned: u64,
}

impl CacheSlot {
    pub fn new(id: SlotId, initial_cells: usize, max_cells: usize) -> Self {
        assert!(
            initial_cells <= max_cells,
            "initial_cells ({initial_cells}) must not exceed max_cells ({max_cells})"
        );
        Self {
            id,
            initial_cells,
            allocated_cells: initial_cells,
            used_cells: 0,
            max_cells,
            active: false,
            last_assigned: 0,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn initial_cells(&self) -> usize {
        self.initial_cells
    }

    pub fn allocated_cells(&self) -> usize {
        self.allocated_cells
    }

    pub fn used_cells(&self) -> usize {
        self.used_cells
    }

    pub fn max_cells(&self) -> usize {
        self.max_cells
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn last_assigned(&self) -> u64 {
        self.last_assigned
    }

    /// Cells that can still be used without growing.
    pub fn free_cells(&self) -> usize {
        self.allocated_cells - self.used_cells
    }

    /// Hand the slot to a new sequence. `generation` orders assignments for LRU reuse.
    pub(crate) fn assign(&mut self, generation: u64) {
        debug_assert!(!self.active, "{} assigned while active", self.id);
        self.active = true;
        self.used_cells = 0;
        self.last_assigned = generation;
    }

    /// Return the slot to the free pool. Cached cells stay resident until the
    /// slot is reassigned. Returns `false` if the slot was already free.
    pub(crate) fn release(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }

    /// Record `cells` more cells of live KV data. Capacity must already be there.
    pub(crate) fn commit(&mut self, cells: usize) {
        let used = self.used_cells.saturating_add(cells);
        assert!(
            used <= self.allocated_cells,
            "{}: committing {cells} cells would exceed allocation ({used} > {})",
            self.id,
            self.allocated_cells
        );
        self.used_cells = used;
    }

    pub(crate) fn set_allocated(&mut self, cells: usize) {
        assert!(
            cells >= self.allocated_cells && cells <= self.max_cells,
            "{}: allocation {cells} outside [{}, {}]",
            self.id,
            self.allocated_cells,
            self.max_cells
        );
        self.allocated_cells = cells;
    }
}
