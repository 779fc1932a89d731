// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Work of one scheduling step, and the caller-facing message for a failed step.

use std::error::Error;
use std::sync::Arc;

use crate::error::find_in_chain;
use crate::kvcache::KvCacheGrowError;
use crate::sequence::{DoneReason, Response, Sequence, SequenceId};

const BATCH_FAILURE: &str = "failed to process batch";

/// One sequence's share of a scheduling step.
#[derive(Debug)]
pub struct BatchEntry {
    pub sequence: Arc<Sequence>,
    /// Cells this step appends to the sequence's slot.
    pub cells: usize,
    /// Output produced for the sequence by this step, if any.
    pub output: Option<Response>,
    /// Embedding produced by this step. Completes the sequence.
    pub embedding: Option<Vec<f32>>,
    /// Terminal reason decided by the model, e.g. an end-of-sequence token.
    pub done: Option<DoneReason>,
}

impl BatchEntry {
    pub fn new(sequence: Arc<Sequence>, cells: usize) -> Self {
        Self {
            sequence,
            cells,
            output: None,
            embedding: None,
            done: None,
        }
    }

    pub fn with_output(mut self, output: Response) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn finishing(mut self, reason: DoneReason) -> Self {
        self.done = Some(reason);
        self
    }
}

/// Sequences processed together in one scheduling step.
#[derive(Debug, Default)]
pub struct BatchState {
    entries: Vec<BatchEntry>,
}

impl BatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: BatchEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn sequences(&self) -> impl Iterator<Item = &Arc<Sequence>> {
        self.entries.iter().map(|entry| &entry.sequence)
    }

    pub fn sequence_ids(&self) -> Vec<SequenceId> {
        self.sequences().map(|seq| seq.id()).collect()
    }
}

impl FromIterator<BatchEntry> for BatchState {
    fn from_iter<I: IntoIterator<Item = BatchEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Message reported to every sequence of a failed batch.
///
/// A KV cache growth failure anywhere in the error chain takes priority and
/// yields the fixed capacity message, whatever the cause says. Anything else is
/// reported as a generic batch failure.
pub fn failure_message(err: &(dyn Error + 'static)) -> String {
    if let Some(grow) = find_in_chain::<KvCacheGrowError>(err) {
        return format!(
            "insufficient memory while expanding KV cache (cells {} -> {}, max {})",
            grow.from_cells, grow.to_cells, grow.max_cells
        );
    }

    let detail = err.to_string();
    if detail.is_empty() {
        BATCH_FAILURE.to_string()
    } else {
        format!("{BATCH_FAILURE}: {detail}")
    }
}
