// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Compute backend allocation capability.
//!
//! The runner never talks to the tensor backend directly. The only thing it
//! needs is the ability to ask for more KV cells for a given slot, and to learn
//! whether that request failed because the device is out of memory.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::kvcache::SlotId;

/// The backend could not satisfy an allocation because memory is exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("no memory available on compute backend")]
pub struct NoMemError {
    /// Number of cells that were requested, when the backend reports it.
    pub requested_cells: Option<usize>,
}

/// Failure reported by a [`CacheBackend`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    NoMem(#[from] NoMemError),

    #[error("backend allocation failed: {0}")]
    Allocation(String),
}

impl BackendError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, BackendError::NoMem(_))
    }
}

/// Single capability consumed from the compute backend: extend the cache region
/// backing `slot` by `additional_cells` cells.
///
/// Implementations must be all-or-nothing: on error nothing was reserved.
pub trait CacheBackend: Send + Sync {
    fn extend(&self, slot: SlotId, additional_cells: usize) -> Result<(), BackendError>;
}

/// Host-side backend that accounts cells against a fixed budget.
///
/// Used when no device backend is wired in, and by tests to drive
/// out-of-memory paths deterministically.
#[derive(Debug)]
pub struct HostMemoryBackend {
    budget_cells: Option<usize>,
    reserved_cells: AtomicUsize,
}

impl HostMemoryBackend {
    /// A backend that never runs out of memory.
    pub fn unbounded() -> Self {
        Self {
            budget_cells: None,
            reserved_cells: AtomicUsize::new(0),
        }
    }

    /// A backend that fails with [`NoMemError`] once `budget_cells` would be exceeded.
    pub fn with_budget(budget_cells: usize) -> Self {
        Self {
            budget_cells: Some(budget_cells),
            reserved_cells: AtomicUsize::new(0),
        }
    }

    /// Cells handed out so far.
    pub fn reserved_cells(&self) -> usize {
        self.reserved_cells.load(Ordering::Acquire)
    }
}

impl CacheBackend for HostMemoryBackend {
    fn extend(&self, slot: SlotId, additional_cells: usize) -> Result<(), BackendError> {
        let Some(budget) = self.budget_cells else {
            self.reserved_cells
                .fetch_add(additional_cells, Ordering::AcqRel);
            return Ok(());
        };

        self.reserved_cells
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                reserved
                    .checked_add(additional_cells)
                    .filter(|&total| total <= budget)
            })
            .map(|_| ())
            .map_err(|reserved| {
                tracing::debug!(
                    slot = %slot,
                    additional_cells,
                    reserved,
                    budget,
                    "host backend budget exhausted"
                );
                NoMemError {
                    requested_cells: Some(additional_cells),
                }
                .into()
            })
    }
}
