// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use crate::backend::BackendError;

/// A dynamic KV cache growth attempt failed.
///
/// Carries the attempted transition and wraps the backend error (often
/// [`crate::backend::NoMemError`]) so callers can inspect the root cause through
/// [`std::error::Error::source`] or [`KvCacheGrowError::cause`].
///
/// Growth never changes device placement. A failure caused by memory pressure
/// has to be resolved by the operator: shorter context, fewer parallel
/// sequences, or more free device memory.
#[derive(Debug)]
pub struct KvCacheGrowError {
    pub from_cells: usize,
    pub to_cells: usize,
    pub max_cells: usize,
    cause: BackendError,
}

impl KvCacheGrowError {
    pub fn new(from_cells: usize, to_cells: usize, max_cells: usize, cause: BackendError) -> Self {
        Self {
            from_cells,
            to_cells,
            max_cells,
            cause,
        }
    }

    pub fn cause(&self) -> &BackendError {
        &self.cause
    }

    pub fn into_cause(self) -> BackendError {
        self.cause
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.cause.is_out_of_memory()
    }
}

impl fmt::Display for KvCacheGrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kv cache grow failed (cells {} -> {}, max {}): {}",
            self.from_cells, self.to_cells, self.max_cells, self.cause
        )
    }
}

impl std::error::Error for KvCacheGrowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}
