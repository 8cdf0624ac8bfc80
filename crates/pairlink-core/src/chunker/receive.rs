//! Buffered reassembly — collect a whole transfer, then hand it over.

use std::collections::hash_map::Entry;
use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::wire::{ChunkHeader, TransferId, HEADER_SIZE, METADATA_INDEX};

use super::{lock, BinaryChunker, ChunkError, TransferTimer};

/// Outcome of feeding one frame to the chunker.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub transfer_id: TransferId,
    /// The reassembled payload, present only on the completing frame.
    pub data: Option<Bytes>,
    /// Decoded metadata, present once the metadata frame has arrived and
    /// carried something other than `null`.
    pub metadata: Option<serde_json::Value>,
    /// The frame belonged to a promoted stream, live or cancelled.
    pub is_stream: bool,
}

pub(super) struct PendingAssembly {
    pub(super) metadata: Option<serde_json::Value>,
    /// Sparse frame payloads by chunk index, metadata slot included.
    pub(super) chunks: BTreeMap<u32, Bytes>,
    pub(super) has_final: bool,
    /// Total frame count (metadata included), known once the final frame lands.
    pub(super) expected_total: Option<u64>,
    pub(super) timer: TransferTimer,
}

impl PendingAssembly {
    fn new(timer: TransferTimer) -> Self {
        Self {
            metadata: None,
            chunks: BTreeMap::new(),
            has_final: false,
            expected_total: None,
            timer,
        }
    }

    fn store(&mut self, index: u32, is_final: bool, payload: Bytes) {
        if index == METADATA_INDEX {
            self.metadata = decode_metadata(&payload);
        }
        self.chunks.insert(index, payload);
        if is_final {
            self.has_final = true;
            self.expected_total = Some(u64::from(index) + 1);
        }
    }

    fn is_complete(&self) -> bool {
        self.has_final && self.expected_total == Some(self.chunks.len() as u64)
    }

    /// Concatenate every payload slot after the metadata slot, by index.
    fn assemble(&self) -> Bytes {
        let payload = self.chunks.range(METADATA_INDEX + 1..);
        let len = payload.clone().map(|(_, b)| b.len()).sum::<usize>();
        let mut out = BytesMut::with_capacity(len);
        for (_, bytes) in payload {
            out.extend_from_slice(bytes);
        }
        out.freeze()
    }
}

/// Metadata JSON that fails to parse, or parses to `null`, counts as absent.
fn decode_metadata(payload: &[u8]) -> Option<serde_json::Value> {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Null) => None,
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(error = %e, "transfer metadata is not valid JSON, ignoring");
            None
        }
    }
}

impl BinaryChunker {
    /// Feed one frame from the binary channel.
    ///
    /// Frames may arrive in any order. Completion is decided by chunk index
    /// alone: once the final frame is known and every slot up to it is
    /// filled, the payload is returned and the transfer's state is dropped.
    pub fn receive_chunk(&self, frame: Bytes) -> Result<Received, ChunkError> {
        let header = ChunkHeader::parse(&frame)?;
        let id = header.id();
        let index = header.index();
        let is_final = header.is_final();
        let payload = frame.slice(HEADER_SIZE..);

        tracing::trace!(transfer_id = %id, index, is_final, len = payload.len(), "frame received");

        let mut tables = lock(&self.tables);

        if tables.streams.contains_key(&id) {
            self.handle_stream(&mut tables, id, index, is_final, payload);
            return Ok(Received {
                transfer_id: id,
                data: None,
                metadata: None,
                is_stream: true,
            });
        }
        if tables.is_cancelled(id) {
            tracing::trace!(transfer_id = %id, index, "dropping frame of a cancelled stream");
            return Ok(Received {
                transfer_id: id,
                data: None,
                metadata: None,
                is_stream: true,
            });
        }

        let timer = self.arm_timer(&mut tables, id);
        let assembly = match tables.assemblies.entry(id) {
            Entry::Occupied(entry) => {
                let assembly = entry.into_mut();
                assembly.timer = timer;
                assembly
            }
            Entry::Vacant(entry) => entry.insert(PendingAssembly::new(timer)),
        };
        assembly.store(index, is_final, payload);

        if !assembly.is_complete() {
            return Ok(Received {
                transfer_id: id,
                data: None,
                metadata: assembly.metadata.clone(),
                is_stream: false,
            });
        }

        let data = assembly.assemble();
        let metadata = assembly.metadata.take();
        tables.assemblies.remove(&id);
        drop(tables);

        tracing::debug!(transfer_id = %id, bytes = data.len(), "transfer reassembled");

        Ok(Received {
            transfer_id: id,
            data: Some(data),
            metadata,
            is_stream: false,
        })
    }
}
