// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dynamic KV cache growth.
//!
//! Slots start at `initial_cells` and grow in `grow_step_cells` increments up
//! to `max_cells`. Growth asks the same backend for more cells; it never moves
//! a slot to another device. A failed growth leaves the slot untouched.

use std::sync::Arc;

use super::errors::KvCacheGrowError;
use super::slot::CacheSlot;
use crate::backend::CacheBackend;

/// Result of making room for more cells in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The current allocation already holds the requested cells.
    Fits,
    /// The slot was grown.
    Grew { from_cells: usize, to_cells: usize },
    /// The request exceeds the per-slot maximum; no growth can satisfy it.
    ContextFull { needed_cells: usize },
}

pub struct GrowthController {
    backend: Arc<dyn CacheBackend>,
    step_cells: usize,
}

impl GrowthController {
    pub fn new(backend: Arc<dyn CacheBackend>, step_cells: usize) -> Self {
        assert!(step_cells > 0, "grow step must be at least one cell");
        Self {
            backend,
            step_cells,
        }
    }

    pub fn step_cells(&self) -> usize {
        self.step_cells
    }

    /// Grow `slot` from `from_cells` to `to_cells`.
    ///
    /// # Panics
    /// The transition must be consistent with the slot: `from_cells` equals the
    /// current allocation and `from_cells < to_cells <= max_cells`. Anything else
    /// is a bug in the caller.
    pub fn grow(
        &self,
        slot: &mut CacheSlot,
        from_cells: usize,
        to_cells: usize,
        max_cells: usize,
    ) -> Result<(), KvCacheGrowError> {
        assert_eq!(
            from_cells,
            slot.allocated_cells(),
            "{}: grow from {from_cells} cells but slot holds {}",
            slot.id(),
            slot.allocated_cells()
        );
        assert!(
            to_cells > from_cells,
            "{}: grow target {to_cells} must exceed {from_cells}",
            slot.id()
        );
        assert!(
            to_cells <= max_cells && max_cells <= slot.max_cells(),
            "{}: grow target {to_cells} exceeds max {max_cells}",
            slot.id()
        );

        match self.backend.extend(slot.id(), to_cells - from_cells) {
            Ok(()) => {
                slot.set_allocated(to_cells);
                tracing::debug!(
                    slot = %slot.id(),
                    from_cells,
                    to_cells,
                    max_cells,
                    "kv cache grown"
                );
                Ok(())
            }
            Err(cause) => {
                let err = KvCacheGrowError::new(from_cells, to_cells, max_cells, cause);
                tracing::warn!(
                    slot = %slot.id(),
                    from_cells,
                    to_cells,
                    max_cells,
                    out_of_memory = err.is_out_of_memory(),
                    error = %err.cause(),
                    "kv cache grow failed"
                );
                Err(err)
            }
        }
    }

    /// Allocation to grow to when `needed_cells` must fit in a slot currently
    /// holding `allocated_cells`: rounded up to the step, at least one step past
    /// the current allocation, capped at `max_cells`.
    pub fn target_cells(
        &self,
        allocated_cells: usize,
        needed_cells: usize,
        max_cells: usize,
    ) -> usize {
        let rounded = needed_cells
            .div_ceil(self.step_cells)
            .saturating_mul(self.step_cells);
        rounded
            .max(allocated_cells.saturating_add(self.step_cells))
            .min(max_cells)
    }

    /// Make sure `slot` can hold `additional_cells` more cells, growing it if needed.
    pub fn reserve(
        &self,
        slot: &mut CacheSlot,
        additional_cells: usize,
    ) -> Result<Reservation, KvCacheGrowError> {
        let needed_cells = slot.used_cells().saturating_add(additional_cells);
        if needed_cells <= slot.allocated_cells() {
            return Ok(Reservation::Fits);
        }
        if needed_cells > slot.max_cells() {
            return Ok(Reservation::ContextFull { needed_cells });
        }

        let from_cells = slot.allocated_cells();
        let to_cells = self.target_cells(from_cells, needed_cells, slot.max_cells());
        self.grow(slot, from_cells, to_cells, slot.max_cells())?;
        Ok(Reservation::Grew {
            from_cells,
            to_cells,
        })
    }
}
