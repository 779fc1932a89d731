// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Point-in-time runner utilization.
//!
//! [`RunnerStats`] is served on the runner's `/stats` endpoint and polled by
//! the orchestrator through [`client::StatsClient`]. The JSON keys are part of
//! the wire contract and must not change.

pub mod client;

use serde::{Deserialize, Serialize};

use crate::kvcache::CacheSlot;

pub use client::{RunnerHandle, StatsClient, StatsError};

/// Path of the stats endpoint on the runner.
pub const STATS_PATH: &str = "/stats";

/// Best-effort, point-in-time stats about a runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStats {
    /// Hard ceiling on cells per slot.
    pub context_max: usize,
    /// Cached-context watermark: the maximum number of cells currently stored
    /// in any slot, active or not.
    pub context_used: usize,
    /// Maximum number of cells stored in any active slot.
    pub context_active: usize,
    /// Current per-slot allocation, after dynamic growth.
    pub context_allocated: usize,
    /// Per-slot allocation at cache creation, before any growth.
    pub context_initial: usize,
    pub slots: usize,
    pub slots_in_use: usize,
}

impl RunnerStats {
    /// Compute stats from the current slot state.
    ///
    /// Slots within a runner are homogeneous in capacity, so the allocation
    /// fields report the largest slot. An empty slot set yields all zeroes.
    pub fn from_slots(slots: &[CacheSlot], context_max: usize) -> Self {
        if slots.is_empty() {
            return Self::default();
        }

        let mut stats = Self {
            context_max,
            slots: slots.len(),
            ..Self::default()
        };
        for slot in slots {
            stats.context_used = stats.context_used.max(slot.used_cells());
            stats.context_allocated = stats.context_allocated.max(slot.allocated_cells());
            stats.context_initial = stats.context_initial.max(slot.initial_cells());
            if slot.is_active() {
                stats.slots_in_use += 1;
                stats.context_active = stats.context_active.max(slot.used_cells());
            }
        }
        stats
    }

    /// Fraction of slots currently serving a sequence.
    pub fn slot_utilization(&self) -> f64 {
        if self.slots == 0 {
            return 0.0;
        }
        self.slots_in_use as f64 / self.slots as f64
    }
}
