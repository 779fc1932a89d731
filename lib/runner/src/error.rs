// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Crate-level error type and helpers for walking error chains.

use std::error::Error;

use crate::admission::AdmissionError;
use crate::backend::BackendError;
use crate::kvcache::KvCacheGrowError;

/// Errors surfaced by [`crate::Runner`] operations.
///
/// Variants keep their inner error as the `source()` so chain walks such as
/// [`find_in_chain`] see it.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("{0}")]
    Admission(#[from] AdmissionError),

    #[error("{0}")]
    KvCacheGrow(#[from] KvCacheGrowError),

    #[error("{0}")]
    Backend(#[from] BackendError),

    /// An admitted sequence found every slot taken. The gate and the pool are
    /// sized together, so this is a bookkeeping bug.
    #[error("no free cache slot for admitted sequence")]
    NoFreeSlot,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Find the first error of type `E` in the chain starting at `err` (inclusive).
pub fn find_in_chain<'a, E>(err: &'a (dyn Error + 'static)) -> Option<&'a E>
where
    E: Error + 'static,
{
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<E>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

/// Whether an error of type `E` appears anywhere in the chain.
pub fn chain_contains<E>(err: &(dyn Error + 'static)) -> bool
where
    E: Error + 'static,
{
    find_in_chain::<E>(err).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NoMemError;
    use anyhow::Context;

    fn grow_error() -> KvCacheGrowError {
        KvCacheGrowError::new(4096, 5120, 262144, NoMemError::default().into())
    }

    #[test]
    fn test_find_self() {
        let err = grow_error();
        let found = find_in_chain::<KvCacheGrowError>(&err).unwrap();
        assert_eq!(found.to_cells, 5120);
    }

    #[test]
    fn test_find_through_runner_error() {
        let err = RunnerError::from(grow_error());
        assert!(chain_contains::<KvCacheGrowError>(&err));
        assert!(chain_contains::<BackendError>(&err));
        assert!(chain_contains::<NoMemError>(&err));
        assert!(!chain_contains::<AdmissionError>(&err));
    }

    #[test]
    fn test_find_through_anyhow_context() {
        let err = Err::<(), _>(grow_error())
            .context("decode step 7")
            .unwrap_err();
        let err = RunnerError::from(err);

        let found = find_in_chain::<KvCacheGrowError>(&err).unwrap();
        assert_eq!((found.from_cells, found.max_cells), (4096, 262144));
    }

    #[test]
    fn test_display_is_transparent() {
        let err = RunnerError::from(AdmissionError::Closed);
        assert_eq!(err.to_string(), "runner is shutting down");
    }
}
