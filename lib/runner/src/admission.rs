// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded-concurrency admission of sequences.
//!
//! The gate holds one permit per slot. A sequence must hold a [`Lease`] for as
//! long as it is mid-generation. Waiters are served in FIFO order, so admission
//! is starvation-free as long as leases are eventually released.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// The caller stopped waiting. Not a generation failure.
    #[error("admission cancelled")]
    Cancelled,

    #[error("timed out waiting for a free sequence slot")]
    Timeout,

    #[error("runner is shutting down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Proof of admission. Returns its unit of capacity when released or dropped.
#[derive(Debug)]
pub struct Lease {
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn release(self) {}
}

impl AdmissionGate {
    pub fn new(parallelism: usize) -> Self {
        assert!(parallelism > 0, "parallelism must be at least 1");
        Self {
            semaphore: Arc::new(Semaphore::new(parallelism)),
            capacity: parallelism,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Leases that can be granted right now without waiting.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    /// Wait for a unit of capacity, or until `cancel` fires.
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<Lease, AdmissionError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AdmissionError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit
                .map(|permit| Lease { _permit: permit })
                .map_err(|_| AdmissionError::Closed),
        }
    }

    /// Like [`AdmissionGate::admit`] with an upper bound on the wait.
    pub async fn admit_timeout(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Lease, AdmissionError> {
        tokio::time::timeout(timeout, self.admit(cancel))
            .await
            .unwrap_or(Err(AdmissionError::Timeout))
    }

    /// Grant a lease only if one is free right now.
    pub fn try_admit(&self) -> Option<Lease> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Lease { _permit: permit })
    }

    /// Stop admitting. Pending and future waiters get [`AdmissionError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}
