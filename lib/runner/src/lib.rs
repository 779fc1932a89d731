// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dynamo Runner
//!
//! KV cache slot bookkeeping with dynamic growth, bounded sequence admission,
//! batch failure propagation, and the `/stats` utilization endpoint.

pub use anyhow::{Context as ErrorContext, Error, Result, anyhow as error, bail as raise};

pub mod admission;
pub mod backend;
pub mod batch;
pub mod config;
pub mod error;
pub mod http_server;
pub mod kvcache;
pub mod logging;
pub mod metrics;
pub mod runner;
pub mod sequence;
pub mod stats;

pub use admission::{AdmissionError, AdmissionGate, Lease};
pub use backend::{BackendError, CacheBackend, HostMemoryBackend, NoMemError};
pub use batch::{BatchEntry, BatchState};
pub use config::{ConfigError, RunnerConfig};
pub use error::RunnerError;
pub use kvcache::{KvCacheGrowError, SlotId};
pub use runner::{BatchSource, Runner};
pub use sequence::{DoneReason, Response, Sequence, SequenceHandle, SequenceId};
pub use stats::{RunnerHandle, RunnerStats, StatsClient, StatsError};
pub use tokio_util::sync::CancellationToken;
