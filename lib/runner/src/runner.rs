// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The runner: admission, slot assignment, scheduling steps and batch failure.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::admission::{AdmissionGate, Lease};
use crate::backend::{CacheBackend, HostMemoryBackend};
use crate::batch::{self, BatchState};
use crate::config::{ConfigError, RunnerConfig};
use crate::error::{RunnerError, chain_contains};
use crate::kvcache::{GrowthController, KvCacheGrowError, Reservation, SlotPool};
use crate::metrics::RunnerMetrics;
use crate::sequence::{DoneReason, Sequence, SequenceHandle, SequenceId};
use crate::stats::RunnerStats;

/// Produces the work of each scheduling step from the active sequences.
///
/// This is where the model runs. Returning `None` means there is nothing to do
/// this tick.
pub trait BatchSource: Send {
    fn next_batch(&mut self, active: &[Arc<Sequence>]) -> Option<BatchState>;
}

pub struct Runner {
    pool: SlotPool,
    gate: AdmissionGate,
    sequences: Mutex<HashMap<SequenceId, Arc<Sequence>>>,
    metrics: RunnerMetrics,
    schedule_interval: Duration,
    started: Instant,
}

impl Runner {
    /// Runner over `backend`, with one cache slot per unit of parallelism.
    pub fn new(config: &RunnerConfig, backend: Arc<dyn CacheBackend>) -> anyhow::Result<Self> {
        config.validate().map_err(ConfigError::from)?;
        let growth = GrowthController::new(backend, config.grow_step_cells);
        let pool = SlotPool::new(
            config.parallelism,
            config.initial_cells,
            config.max_cells_per_slot,
            growth,
        );

        tracing::info!(
            parallelism = config.parallelism,
            initial_cells = config.initial_cells,
            max_cells = config.max_cells_per_slot,
            grow_step_cells = config.grow_step_cells,
            "runner cache created"
        );

        Ok(Self {
            pool,
            gate: AdmissionGate::new(config.parallelism),
            sequences: Mutex::new(HashMap::new()),
            metrics: RunnerMetrics::new()?,
            schedule_interval: config.schedule_interval(),
            started: Instant::now(),
        })
    }

    /// Runner over a host-memory backend sized by `backend_budget_cells`.
    pub fn from_config(config: &RunnerConfig) -> anyhow::Result<Self> {
        let backend = match config.backend_budget_cells {
            Some(cells) => HostMemoryBackend::with_budget(cells),
            None => HostMemoryBackend::unbounded(),
        };
        Self::new(config, Arc::new(backend))
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn metrics(&self) -> &RunnerMetrics {
        &self.metrics
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Admit a new sequence, waiting for capacity until `cancel` fires.
    pub async fn new_sequence(
        &self,
        cancel: &CancellationToken,
        embedding: bool,
    ) -> Result<SequenceHandle, RunnerError> {
        let lease = self.gate.admit(cancel).await?;
        let slot = self.pool.acquire().ok_or(RunnerError::NoFreeSlot)?;

        let (sequence, handle) = Sequence::new(slot, lease, embedding);
        tracing::debug!(sequence = %sequence.id(), %slot, "sequence admitted");
        self.sequences.lock().insert(sequence.id(), sequence);
        self.metrics.sequences_admitted.inc();
        Ok(handle)
    }

    pub fn sequence(&self, id: SequenceId) -> Option<Arc<Sequence>> {
        self.sequences.lock().get(&id).cloned()
    }

    /// Sequences that have not reached a terminal state.
    pub fn active_sequences(&self) -> Vec<Arc<Sequence>> {
        self.sequences.lock().values().cloned().collect()
    }

    pub fn stats(&self) -> RunnerStats {
        self.pool.stats()
    }

    /// Run one scheduling step.
    ///
    /// If the step fails, every sequence in `batch` is terminated with an
    /// error and the failure is returned for logging.
    pub fn step(&self, batch: BatchState) -> Result<(), RunnerError> {
        match self.process_batch(&batch) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail_batch(&batch, &err);
                Err(err)
            }
        }
    }

    /// Reserve cache cells for every entry, then deliver the step's outputs.
    ///
    /// Reservation happens for the whole batch before anything is delivered,
    /// so a failed step produces no partial output.
    fn process_batch(&self, batch: &BatchState) -> Result<(), RunnerError> {
        for entry in batch.entries() {
            let seq = &entry.sequence;
            if seq.is_done() {
                continue;
            }
            if seq.quit_requested() {
                self.finish(seq, DoneReason::Cancel);
                continue;
            }

            match self.pool.append(seq.slot(), entry.cells)? {
                Reservation::Fits => {}
                Reservation::Grew { .. } => self.metrics.kv_grow_total.inc(),
                Reservation::ContextFull { needed_cells } => {
                    tracing::debug!(
                        sequence = %seq.id(),
                        needed_cells,
                        max_cells = self.pool.max_cells(),
                        "context limit reached"
                    );
                    self.finish(seq, DoneReason::Length);
                }
            }
        }

        for entry in batch.entries() {
            let seq = &entry.sequence;
            if seq.is_done() {
                continue;
            }
            if let Some(output) = &entry.output
                && !seq.send(output.clone())
            {
                self.finish(seq, DoneReason::Cancel);
                continue;
            }
            if let Some(embedding) = &entry.embedding {
                seq.send_embedding(embedding.clone());
                self.finish(seq, DoneReason::Stop);
                continue;
            }
            if let Some(reason) = entry.done {
                self.finish(seq, reason);
            }
        }
        Ok(())
    }

    /// Terminate every sequence in `batch` with an error derived from `err`.
    ///
    /// A KV cache growth failure anywhere in the chain is reported with the
    /// capacity message; anything else as a generic batch failure. Sequences
    /// already terminal are left alone, so calling this twice is harmless.
    pub fn fail_batch(&self, batch: &BatchState, err: &(dyn Error + 'static)) {
        let message = batch::failure_message(err);
        self.metrics.failed_batches.inc();
        if chain_contains::<KvCacheGrowError>(err) {
            self.metrics.kv_grow_failures.inc();
        }

        let mut failed = 0;
        for seq in batch.sequences() {
            if let Some(lease) = seq.fail(message.clone()) {
                self.release(seq, lease);
                failed += 1;
            }
        }

        tracing::error!(
            batch_size = batch.len(),
            failed,
            error = %err,
            message = %message,
            "failed to process batch"
        );
    }

    /// Stop sequences whose caller asked to quit. Returns how many were stopped.
    pub fn reap_cancelled(&self) -> usize {
        self.active_sequences()
            .iter()
            .filter(|seq| seq.quit_requested())
            .filter(|seq| self.finish(seq, DoneReason::Cancel))
            .count()
    }

    /// Terminate a sequence normally and give back its slot.
    pub fn finish(&self, seq: &Sequence, reason: DoneReason) -> bool {
        let Some(lease) = seq.finish(reason) else {
            return false;
        };
        tracing::debug!(sequence = %seq.id(), %reason, "sequence finished");
        self.release(seq, lease);
        true
    }

    /// The slot must be free before the lease goes back: a waiter woken by the
    /// lease acquires a slot right away.
    fn release(&self, seq: &Sequence, lease: Lease) {
        self.sequences.lock().remove(&seq.id());
        self.pool.release(seq.slot());
        lease.release();
    }

    /// Drive scheduling steps from `source` until `cancel` fires, then stop
    /// admitting and cancel every live sequence.
    pub async fn run<S: BatchSource>(&self, mut source: S, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.schedule_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.reap_cancelled();
            let active = self.active_sequences();
            if active.is_empty() {
                continue;
            }
            if let Some(batch) = source.next_batch(&active)
                && !batch.is_empty()
                && let Err(e) = self.step(batch)
            {
                tracing::debug!(error = %e, "scheduling step failed");
            }
        }

        self.shutdown();
    }

    /// Close the gate and cancel all live sequences.
    pub fn shutdown(&self) {
        self.gate.close();
        let cancelled = self
            .active_sequences()
            .iter()
            .filter(|seq| self.finish(seq, DoneReason::Cancel))
            .count();
        tracing::info!(cancelled, "runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, NoMemError};
    use crate::batch::BatchEntry;
    use crate::kvcache::SlotId;
    use crate::sequence::Response;
    use rstest::rstest;

    fn config(parallelism: usize) -> RunnerConfig {
        RunnerConfig {
            parallelism,
            ..Default::default()
        }
    }

    fn runner(parallelism: usize, budget: Option<usize>) -> Runner {
        Runner::from_config(&RunnerConfig {
            backend_budget_cells: budget,
            ..config(parallelism)
        })
        .unwrap()
    }

    async fn admit(runner: &Runner) -> SequenceHandle {
        runner
            .new_sequence(&CancellationToken::new(), false)
            .await
            .unwrap()
    }

    #[rstest]
    #[case::zero_parallelism(RunnerConfig { parallelism: 0, ..Default::default() })]
    #[case::initial_above_max(RunnerConfig {
        initial_cells: 8192,
        max_cells_per_slot: 4096,
        ..Default::default()
    })]
    #[case::zero_grow_step(RunnerConfig { grow_step_cells: 0, ..Default::default() })]
    fn test_invalid_config_is_rejected(#[case] config: RunnerConfig) {
        let err = Runner::from_config(&config)
            .err()
            .expect("invalid config must not build a runner");
        assert!(
            matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::Validation(_))),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_growth_failure_fails_batch() {
        let runner = runner(1, Some(0));
        let mut handle = admit(&runner).await;
        let seq = runner.sequence(handle.id()).unwrap();

        runner
            .step([BatchEntry::new(seq.clone(), 4000)].into_iter().collect())
            .unwrap();

        let err = runner
            .step([BatchEntry::new(seq.clone(), 200)].into_iter().collect())
            .unwrap_err();
        assert!(matches!(err, RunnerError::KvCacheGrow(_)), "got {err:?}");

        assert_eq!(handle.recv().await, None);
        assert_eq!(handle.done_reason(), Some(DoneReason::Error));
        assert_eq!(
            handle.error_message().as_deref(),
            Some("insufficient memory while expanding KV cache (cells 4096 -> 5120, max 262144)")
        );

        let stats = runner.stats();
        assert_eq!(stats.slots_in_use, 0);
        assert_eq!(stats.context_allocated, 4096);
        assert_eq!(runner.gate().available(), 1);
        assert_eq!(runner.metrics().kv_grow_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_whole_batch_fails_together() {
        let runner = runner(2, Some(0));
        let a = admit(&runner).await;
        let b = admit(&runner).await;
        let seq_a = runner.sequence(a.id()).unwrap();
        let seq_b = runner.sequence(b.id()).unwrap();

        let batch: BatchState = [
            BatchEntry::new(seq_a, 10),
            BatchEntry::new(seq_b, 5000),
        ]
        .into_iter()
        .collect();
        runner.step(batch).unwrap_err();

        for handle in [&a, &b] {
            assert_eq!(handle.done_reason(), Some(DoneReason::Error));
        }
        assert!(runner.active_sequences().is_empty());
        assert_eq!(runner.stats().slots_in_use, 0);
    }

    #[tokio::test]
    async fn test_fail_batch_is_idempotent() {
        let runner = runner(1, None);
        let handle = admit(&runner).await;
        let seq = runner.sequence(handle.id()).unwrap();
        let batch: BatchState = [BatchEntry::new(seq, 1)].into_iter().collect();

        let err = BackendError::Allocation("device lost".to_string());
        runner.fail_batch(&batch, &err);
        let first = handle.error_message();
        runner.fail_batch(&batch, &NoMemError::default());

        assert_eq!(
            first.as_deref(),
            Some("failed to process batch: backend allocation failed: device lost")
        );
        assert_eq!(handle.error_message(), first);
        assert_eq!(runner.gate().available(), 1);
        assert_eq!(runner.stats().slots_in_use, 0);
    }

    #[tokio::test]
    async fn test_fail_batch_skips_finished_sequences() {
        let runner = runner(2, None);
        let a = admit(&runner).await;
        let b = admit(&runner).await;
        let seq_a = runner.sequence(a.id()).unwrap();
        let seq_b = runner.sequence(b.id()).unwrap();
        runner.finish(&seq_a, DoneReason::Stop);

        let batch: BatchState = [BatchEntry::new(seq_a, 1), BatchEntry::new(seq_b, 1)]
            .into_iter()
            .collect();
        runner.fail_batch(&batch, &BackendError::Allocation("x".to_string()));

        assert_eq!(a.done_reason(), Some(DoneReason::Stop));
        assert_eq!(a.error_message(), None);
        assert_eq!(b.done_reason(), Some(DoneReason::Error));
    }

    #[tokio::test]
    async fn test_outputs_delivered_in_order() {
        let runner = runner(1, None);
        let mut handle = admit(&runner).await;
        let seq = runner.sequence(handle.id()).unwrap();

        for piece in ["Hel", "lo"] {
            let entry = BatchEntry::new(seq.clone(), 1).with_output(Response::new(piece));
            runner.step([entry].into_iter().collect()).unwrap();
        }
        let entry = BatchEntry::new(seq.clone(), 1).finishing(DoneReason::Stop);
        runner.step([entry].into_iter().collect()).unwrap();

        assert_eq!(handle.recv().await, Some(Response::new("Hel")));
        assert_eq!(handle.recv().await, Some(Response::new("lo")));
        assert_eq!(handle.recv().await, None);
        assert_eq!(handle.done_reason(), Some(DoneReason::Stop));
        assert_eq!(runner.stats().context_used, 3);
    }

    #[tokio::test]
    async fn test_context_full_ends_with_length() {
        let runner = Runner::from_config(&RunnerConfig {
            initial_cells: 1024,
            max_cells_per_slot: 2048,
            ..config(1)
        })
        .unwrap();
        let handle = admit(&runner).await;
        let seq = runner.sequence(handle.id()).unwrap();

        runner
            .step([BatchEntry::new(seq.clone(), 2049)].into_iter().collect())
            .unwrap();
        assert_eq!(handle.done_reason(), Some(DoneReason::Length));
        assert_eq!(runner.stats().slots_in_use, 0);
    }

    #[tokio::test]
    async fn test_embedding_completes_sequence() {
        let runner = runner(1, None);
        let mut handle = runner
            .new_sequence(&CancellationToken::new(), true)
            .await
            .unwrap();
        let seq = runner.sequence(handle.id()).unwrap();

        let entry = BatchEntry::new(seq, 8).with_embedding(vec![0.1, 0.2]);
        runner.step([entry].into_iter().collect()).unwrap();

        assert_eq!(handle.embedding().await, Some(vec![0.1, 0.2]));
        assert_eq!(handle.done_reason(), Some(DoneReason::Stop));
    }

    #[tokio::test]
    async fn test_admission_waits_for_release() {
        let runner = Arc::new(runner(1, None));
        let a = admit(&runner).await;

        let cancel = CancellationToken::new();
        let waiter = {
            let runner = runner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.new_sequence(&cancel, false).await.map(|h| h.id()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        assert_eq!(runner.stats().slots_in_use, 1);

        let seq = runner.sequence(a.id()).unwrap();
        runner.finish(&seq, DoneReason::Stop);

        let b = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("second sequence admitted")
            .unwrap()
            .unwrap();
        assert_ne!(b, a.id());
        assert_eq!(runner.sequence(b).unwrap().slot(), SlotId(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_woken_waiter_always_finds_free_slot() {
        let runner = Arc::new(runner(1, None));

        for _ in 0..200 {
            let a = admit(&runner).await;
            let waiter = {
                let runner = runner.clone();
                tokio::spawn(async move {
                    runner.new_sequence(&CancellationToken::new(), false).await
                })
            };
            // let the waiter park on the gate
            tokio::time::sleep(Duration::from_millis(1)).await;

            let seq = runner.sequence(a.id()).unwrap();
            assert!(runner.finish(&seq, DoneReason::Stop));

            let b = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter admitted")
                .unwrap()
                .unwrap_or_else(|e| panic!("waiter rejected after release: {e}"));
            let seq = runner.sequence(b.id()).unwrap();
            assert!(runner.finish(&seq, DoneReason::Stop));
        }

        assert_eq!(runner.gate().available(), 1);
        assert_eq!(runner.stats().slots_in_use, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reap_racing_fail_batch_releases_once() {
        let parallelism = 4;
        let runner = Arc::new(runner(parallelism, None));

        for _ in 0..100 {
            let mut handles = Vec::new();
            for _ in 0..parallelism {
                handles.push(admit(&runner).await);
            }
            let batch: BatchState = handles
                .iter()
                .map(|h| BatchEntry::new(runner.sequence(h.id()).unwrap(), 1))
                .collect();
            for handle in &handles {
                handle.cancel();
            }

            let reaper = {
                let runner = runner.clone();
                tokio::spawn(async move { runner.reap_cancelled() })
            };
            let failer = {
                let runner = runner.clone();
                tokio::spawn(async move {
                    let err = BackendError::Allocation("device lost".to_string());
                    runner.fail_batch(&batch, &err);
                })
            };
            let reaped = reaper.await.unwrap();
            failer.await.unwrap();

            let reason_count = |reason| {
                handles
                    .iter()
                    .filter(|h| h.done_reason() == Some(reason))
                    .count()
            };
            let cancelled = reason_count(DoneReason::Cancel);
            let failed = reason_count(DoneReason::Error);
            assert_eq!(reaped, cancelled);
            assert_eq!(cancelled + failed, parallelism);

            assert_eq!(runner.gate().available(), parallelism);
            assert_eq!(runner.stats().slots_in_use, 0);
            assert!(runner.active_sequences().is_empty());
        }
    }

    #[tokio::test]
    async fn test_cancelled_admission() {
        let runner = runner(1, None);
        let _held = admit(&runner).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner.new_sequence(&cancel, false).await.unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Admission(crate::admission::AdmissionError::Cancelled)
        ));
        assert_eq!(runner.active_sequences().len(), 1);
    }

    #[tokio::test]
    async fn test_reap_cancelled() {
        let runner = runner(2, None);
        let a = admit(&runner).await;
        let b = admit(&runner).await;

        a.cancel();
        assert_eq!(runner.reap_cancelled(), 1);
        assert_eq!(a.done_reason(), Some(DoneReason::Cancel));
        assert_eq!(b.done_reason(), None);
        assert_eq!(runner.gate().available(), 1);

        drop(b);
        assert_eq!(runner.reap_cancelled(), 1);
        assert_eq!(runner.reap_cancelled(), 0);
        assert_eq!(runner.gate().available(), 2);
    }

    struct OneTokenEach;

    impl BatchSource for OneTokenEach {
        fn next_batch(&mut self, active: &[Arc<Sequence>]) -> Option<BatchState> {
            Some(
                active
                    .iter()
                    .map(|seq| BatchEntry::new(seq.clone(), 1).with_output(Response::new("x")))
                    .collect(),
            )
        }
    }

    #[tokio::test]
    async fn test_run_streams_until_shutdown() {
        let runner = Arc::new(runner(1, None));
        let cancel = CancellationToken::new();
        let mut handle = admit(&runner).await;

        let task = {
            let runner = runner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(OneTokenEach, cancel).await })
        };

        assert_eq!(handle.recv().await, Some(Response::new("x")));
        assert_eq!(handle.recv().await, Some(Response::new("x")));

        cancel.cancel();
        task.await.unwrap();

        while handle.recv().await.is_some() {}
        assert_eq!(handle.done_reason(), Some(DoneReason::Cancel));
        assert!(runner.gate().is_closed());
        let err = runner
            .new_sequence(&CancellationToken::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Admission(crate::admission::AdmissionError::Closed)
        ));
    }
}
