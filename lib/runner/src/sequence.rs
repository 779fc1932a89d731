// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Generation sequences.
//!
//! The runner keeps an `Arc<Sequence>` for every admitted request; the caller
//! holds the matching [`SequenceHandle`]. Responses flow through an ordered
//! channel that is closed exactly once, when the sequence reaches a terminal
//! state. The terminal state is readable from the handle after the channel
//! drains.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::admission::Lease;
use crate::kvcache::SlotId;

pub type SequenceId = Uuid;

/// Why a sequence stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    /// The model finished normally.
    Stop,
    /// The context or token limit was reached.
    Length,
    /// The caller went away or asked to stop.
    Cancel,
    /// The sequence failed; see the error message.
    Error,
}

impl fmt::Display for DoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoneReason::Stop => write!(f, "stop"),
            DoneReason::Length => write!(f, "length"),
            DoneReason::Cancel => write!(f, "cancel"),
            DoneReason::Error => write!(f, "error"),
        }
    }
}

/// One piece of generated output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
}

impl Response {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

#[derive(Debug)]
struct SequenceState {
    done_reason: Option<DoneReason>,
    err_msg: Option<String>,
    responses: Option<mpsc::UnboundedSender<Response>>,
    embedding: Option<oneshot::Sender<Vec<f32>>>,
    lease: Option<Lease>,
}

/// Runner-side view of one in-flight generation request.
#[derive(Debug)]
pub struct Sequence {
    id: SequenceId,
    slot: SlotId,
    quit: CancellationToken,
    state: Mutex<SequenceState>,
}

impl Sequence {
    /// Create a sequence bound to `slot` and holding `lease`, together with the
    /// caller's handle. `embedding` requests the single-shot embedding channel.
    pub(crate) fn new(slot: SlotId, lease: Lease, embedding: bool) -> (Arc<Self>, SequenceHandle) {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (embedding_tx, embedding_rx) = if embedding {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let sequence = Arc::new(Self {
            id: Uuid::new_v4(),
            slot,
            quit: CancellationToken::new(),
            state: Mutex::new(SequenceState {
                done_reason: None,
                err_msg: None,
                responses: Some(response_tx),
                embedding: embedding_tx,
                lease: Some(lease),
            }),
        });

        let handle = SequenceHandle {
            sequence: sequence.clone(),
            responses: response_rx,
            embedding: embedding_rx,
        };
        (sequence, handle)
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done_reason.is_some()
    }

    pub fn done_reason(&self) -> Option<DoneReason> {
        self.state.lock().done_reason
    }

    pub fn error_message(&self) -> Option<String> {
        self.state.lock().err_msg.clone()
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.is_cancelled()
    }

    /// Deliver a response. Returns `false` when the sequence is finished or the
    /// caller stopped listening.
    pub(crate) fn send(&self, response: Response) -> bool {
        let state = self.state.lock();
        match &state.responses {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Deliver the embedding. Only the first call has any effect.
    pub(crate) fn send_embedding(&self, embedding: Vec<f32>) -> bool {
        let tx = self.state.lock().embedding.take();
        match tx {
            Some(tx) => tx.send(embedding).is_ok(),
            None => false,
        }
    }

    /// Terminate normally (`Stop`, `Length` or `Cancel`).
    pub(crate) fn finish(&self, reason: DoneReason) -> Option<Lease> {
        debug_assert_ne!(reason, DoneReason::Error, "use Sequence::fail for errors");
        self.terminate(reason, None)
    }

    /// Terminate with an error message meant for the caller.
    pub(crate) fn fail(&self, message: String) -> Option<Lease> {
        self.terminate(DoneReason::Error, Some(message))
    }

    /// Set the terminal state and close the channels.
    ///
    /// Hands the admission lease to the caller, who must return the cache slot
    /// before dropping it. Returns `None` if the sequence was already terminal;
    /// nothing changes then.
    fn terminate(&self, reason: DoneReason, err_msg: Option<String>) -> Option<Lease> {
        let mut state = self.state.lock();
        if state.done_reason.is_some() {
            return None;
        }
        state.done_reason = Some(reason);
        state.err_msg = err_msg;
        state.responses = None;
        state.embedding = None;
        state.lease.take()
    }
}

/// Caller-side handle of a sequence.
///
/// Dropping the handle asks the runner to stop the sequence.
#[derive(Debug)]
pub struct SequenceHandle {
    sequence: Arc<Sequence>,
    responses: mpsc::UnboundedReceiver<Response>,
    embedding: Option<oneshot::Receiver<Vec<f32>>>,
}

impl SequenceHandle {
    pub fn id(&self) -> SequenceId {
        self.sequence.id()
    }

    /// Next response in order; `None` once the sequence has finished and all
    /// responses were consumed.
    pub async fn recv(&mut self) -> Option<Response> {
        self.responses.recv().await
    }

    /// Wait for the embedding. `None` if none was requested or the sequence
    /// ended without producing one.
    pub async fn embedding(&mut self) -> Option<Vec<f32>> {
        let rx = self.embedding.take()?;
        rx.await.ok()
    }

    /// Ask the runner to stop this sequence.
    pub fn cancel(&self) {
        self.sequence.quit.cancel();
    }

    pub fn done_reason(&self) -> Option<DoneReason> {
        self.sequence.done_reason()
    }

    pub fn error_message(&self) -> Option<String> {
        self.sequence.error_message()
    }
}

impl Drop for SequenceHandle {
    fn drop(&mut self) {
        self.sequence.quit.cancel();
    }
}
