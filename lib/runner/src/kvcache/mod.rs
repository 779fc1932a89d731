// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # KV Cache
//! Per-sequence cache slots, dynamic growth, and the pool that owns them.
//!
//! ## Slots
//! Each in-flight sequence owns exactly one [`CacheSlot`]. A slot tracks the
//! cells reserved for it on the backend (`allocated_cells`) and the cells that
//! hold live key/value data (`used_cells`).
//!
//! ## Growth
//! Slots start small and grow on demand through the [`GrowthController`]. A
//! failed growth returns a [`KvCacheGrowError`] describing the attempted
//! transition and never modifies the slot.

mod errors;
mod grow;
mod pool;
mod slot;

pub use errors::KvCacheGrowError;
pub use grow::{GrowthController, Reservation};
pub use pool::SlotPool;
pub use slot::{CacheSlot, SlotId};
