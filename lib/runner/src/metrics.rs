// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics for a runner.
//!
//! Gauges mirror [`RunnerStats`] and are refreshed from a fresh snapshot at
//! scrape time. Counters are bumped on the scheduling path.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::stats::RunnerStats;

/// Prometheus metric names
pub mod names {
    /// Prefix for all runner metrics
    pub const PREFIX: &str = "dynamo_runner_";

    /// ===== Gauges (ordered to match RunnerStats fields) =====
    pub const CONTEXT_MAX: &str = "dynamo_runner_context_max_cells";
    pub const CONTEXT_USED: &str = "dynamo_runner_context_used_cells";
    pub const CONTEXT_ACTIVE: &str = "dynamo_runner_context_active_cells";
    pub const CONTEXT_ALLOCATED: &str = "dynamo_runner_context_allocated_cells";
    pub const CONTEXT_INITIAL: &str = "dynamo_runner_context_initial_cells";
    pub const SLOTS: &str = "dynamo_runner_slots";
    pub const SLOTS_IN_USE: &str = "dynamo_runner_slots_in_use";

    /// ===== Counters =====
    pub const SEQUENCES_ADMITTED: &str = "dynamo_runner_sequences_admitted_total";
    pub const FAILED_BATCHES: &str = "dynamo_runner_failed_batches_total";
    pub const KV_GROW_TOTAL: &str = "dynamo_runner_kv_grow_total";
    pub const KV_GROW_FAILURES: &str = "dynamo_runner_kv_grow_failures_total";
}

pub struct RunnerMetrics {
    registry: Registry,

    context_max: IntGauge,
    context_used: IntGauge,
    context_active: IntGauge,
    context_allocated: IntGauge,
    context_initial: IntGauge,
    slots: IntGauge,
    slots_in_use: IntGauge,

    pub sequences_admitted: IntCounter,
    pub failed_batches: IntCounter,
    pub kv_grow_total: IntCounter,
    pub kv_grow_failures: IntCounter,
}

impl RunnerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let gauge = IntGauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let context_max = gauge(names::CONTEXT_MAX, "Hard ceiling on cells per slot")?;
        let context_used = gauge(
            names::CONTEXT_USED,
            "Maximum number of cells stored in any slot",
        )?;
        let context_active = gauge(
            names::CONTEXT_ACTIVE,
            "Maximum number of cells stored in any active slot",
        )?;
        let context_allocated = gauge(
            names::CONTEXT_ALLOCATED,
            "Current per-slot allocation after dynamic growth",
        )?;
        let context_initial = gauge(
            names::CONTEXT_INITIAL,
            "Per-slot allocation at cache creation",
        )?;
        let slots = gauge(names::SLOTS, "Number of cache slots")?;
        let slots_in_use = gauge(names::SLOTS_IN_USE, "Cache slots serving a sequence")?;

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let sequences_admitted = counter(names::SEQUENCES_ADMITTED, "Sequences admitted")?;
        let failed_batches = counter(names::FAILED_BATCHES, "Scheduling steps that failed")?;
        let kv_grow_total = counter(names::KV_GROW_TOTAL, "Successful KV cache growths")?;
        let kv_grow_failures = counter(names::KV_GROW_FAILURES, "Failed KV cache growths")?;

        Ok(Self {
            registry,
            context_max,
            context_used,
            context_active,
            context_allocated,
            context_initial,
            slots,
            slots_in_use,
            sequences_admitted,
            failed_batches,
            kv_grow_total,
            kv_grow_failures,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observe(&self, stats: &RunnerStats) {
        self.context_max.set(stats.context_max as i64);
        self.context_used.set(stats.context_used as i64);
        self.context_active.set(stats.context_active as i64);
        self.context_allocated.set(stats.context_allocated as i64);
        self.context_initial.set(stats.context_initial as i64);
        self.slots.set(stats.slots as i64);
        self.slots_in_use.set(stats.slots_in_use as i64);
    }

    /// Refresh gauges from `stats` and render the registry in text format.
    pub fn encode(&self, stats: &RunnerStats) -> anyhow::Result<String> {
        self.observe(stats);

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
