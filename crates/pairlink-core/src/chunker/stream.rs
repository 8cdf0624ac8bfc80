//! Streaming reassembly — emit payload bytes in index order as they arrive.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Mutex, Weak};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::wire::{TransferId, METADATA_INDEX};

use super::{lock, BinaryChunker, ChunkError, Tables, TransferTimer};

type Output = mpsc::UnboundedSender<Result<Bytes, ChunkError>>;

pub(super) struct PendingStream {
    output: Output,
    /// Frames that arrived ahead of `next_expected`.
    buffered: BTreeMap<u32, Bytes>,
    next_expected: u32,
    final_index: Option<u32>,
    pub(super) timer: TransferTimer,
}

impl PendingStream {
    fn accept(&mut self, index: u32, is_final: bool, payload: Bytes) {
        if is_final {
            self.final_index = Some(index);
        }
        if index >= self.next_expected {
            self.buffered.insert(index, payload);
        }
    }

    /// Emit the contiguous run starting at `next_expected`.
    /// Returns false once the reader has gone away.
    fn drain(&mut self) -> bool {
        while let Some(payload) = self.buffered.remove(&self.next_expected) {
            self.next_expected += 1;
            if payload.is_empty() {
                continue;
            }
            if self.output.send(Ok(payload)).is_err() {
                return false;
            }
        }
        true
    }

    fn is_done(&self) -> bool {
        self.buffered.is_empty() && self.final_index.is_some_and(|last| self.next_expected > last)
    }

    /// End the output with `err`. Buffered frames are discarded.
    pub(super) fn fail(self, err: ChunkError) {
        let _ = self.output.send(Err(err));
    }
}

impl BinaryChunker {
    /// Switch a pending transfer from buffered to streaming delivery.
    ///
    /// Frames already received are replayed into the stream in order; later
    /// frames for this transfer go straight to it. Fails if the transfer is
    /// unknown: already promoted, completed, or timed out.
    pub fn set_data_is_stream(&self, id: TransferId) -> Result<TransferStream, ChunkError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut tables = lock(&self.tables);
            let assembly = tables
                .assemblies
                .remove(&id)
                .ok_or(ChunkError::UnknownTransfer(id))?;

            let mut buffered = assembly.chunks;
            buffered.remove(&METADATA_INDEX);
            let final_index = assembly
                .expected_total
                .and_then(|total| u32::try_from(total - 1).ok());

            let timer = self.arm_timer(&mut tables, id);
            let mut stream = PendingStream {
                output: tx,
                buffered,
                next_expected: METADATA_INDEX + 1,
                final_index,
                timer,
            };
            if stream.drain() && !stream.is_done() {
                tables.streams.insert(id, stream);
            }
        }

        tracing::debug!(transfer_id = %id, "transfer promoted to stream");
        Ok(TransferStream {
            id,
            rx,
            tables: Some(std::sync::Arc::downgrade(&self.tables)),
        })
    }

    pub(super) fn handle_stream(
        &self,
        tables: &mut Tables,
        id: TransferId,
        index: u32,
        is_final: bool,
        payload: Bytes,
    ) {
        let timer = self.arm_timer(tables, id);
        let Some(stream) = tables.streams.get_mut(&id) else {
            return;
        };
        stream.timer = timer;
        stream.accept(index, is_final, payload);

        let reader_alive = stream.drain();
        if !reader_alive {
            tables.cancel_stream(id);
            tracing::debug!(transfer_id = %id, "stream reader gone, discarding transfer");
        } else if stream.is_done() {
            tables.streams.remove(&id);
            tracing::debug!(transfer_id = %id, "stream transfer complete");
        }
    }
}

/// In-order payload bytes of one promoted transfer.
///
/// Ends cleanly after the final frame, or with an error if the transfer
/// times out or is cancelled. Dropping the stream cancels the transfer and
/// discards its buffered frames.
pub struct TransferStream {
    id: TransferId,
    rx: mpsc::UnboundedReceiver<Result<Bytes, ChunkError>>,
    tables: Option<Weak<Mutex<Tables>>>,
}

impl TransferStream {
    /// A stream over a transfer that already finished reassembling.
    pub fn from_bytes(id: TransferId, data: Bytes) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        if !data.is_empty() {
            let _ = tx.send(Ok(data));
        }
        Self { id, rx, tables: None }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Stop the transfer and discard whatever is buffered for it.
    pub fn cancel(self) {}

    /// Collect the remaining bytes into one buffer.
    pub async fn read_to_end(mut self) -> Result<Bytes, ChunkError> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    /// Split into `readers` independent streams that each see every byte.
    ///
    /// A background task copies each item to every reader. The upstream
    /// transfer is cancelled once all readers are dropped.
    pub fn tee(self, readers: usize) -> Vec<TransferStream> {
        match readers {
            0 => Vec::new(),
            1 => vec![self],
            n => {
                let id = self.id;
                let (outputs, streams): (Vec<Output>, Vec<TransferStream>) = (0..n)
                    .map(|_| {
                        let (tx, rx) = mpsc::unbounded_channel();
                        (tx, TransferStream { id, rx, tables: None })
                    })
                    .unzip();
                tokio::spawn(fan_out(self, outputs));
                streams
            }
        }
    }
}

async fn fan_out(mut source: TransferStream, mut outputs: Vec<Output>) {
    while let Some(item) = source.next().await {
        outputs.retain(|tx| tx.send(item.clone()).is_ok());
        if outputs.is_empty() {
            tracing::debug!(transfer_id = %source.id, "all stream readers dropped");
            return;
        }
    }
}

impl Stream for TransferStream {
    type Item = Result<Bytes, ChunkError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for TransferStream {
    fn drop(&mut self) {
        let Some(tables) = self.tables.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        if lock(&tables).cancel_stream(self.id) {
            tracing::debug!(transfer_id = %self.id, "transfer stream cancelled");
        }
    }
}

impl std::fmt::Debug for TransferStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferStream").field("id", &self.id).finish()
    }
}
