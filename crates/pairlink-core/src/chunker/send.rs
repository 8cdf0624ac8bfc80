//! Sending side — repack payload bytes into fixed-size frames.
//!
//! Both modes share one packer. Buffer mode feeds it from a one-shot
//! iterator, stream mode from a live producer. A full staging buffer is only
//! flushed once more bytes arrive, so the last frame of a transfer is always
//! the one marked final and an empty final frame appears only for an empty
//! payload.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{ready, Stream, StreamExt};
use zerocopy::AsBytes;

use crate::wire::{ChunkHeader, TransferId, HEADER_SIZE, METADATA_INDEX};

use super::{BinaryChunker, ChunkError};

impl BinaryChunker {
    /// Frames for an in-memory buffer. Lazy, finite, and not restartable.
    pub fn chunk(
        &self,
        data: Bytes,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Frames<std::iter::Once<Bytes>>, ChunkError> {
        Frames::new(self.max_frame_size, std::iter::once(data), metadata)
    }

    /// Frames for a live byte source. Upstream items may be any size.
    ///
    /// An upstream error ends the frame stream after yielding the error; the
    /// receiver never sees a final frame and times the transfer out.
    pub fn stream<S, E>(
        &self,
        source: S,
        metadata: Option<&serde_json::Value>,
    ) -> Result<FrameStream<S>, ChunkError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
    {
        FrameStream::new(self.max_frame_size, source, metadata)
    }
}

/// Per-transfer generator state: id, running index, staging buffer.
struct FramePacker {
    transfer_id: TransferId,
    capacity: usize,
    staging: BytesMut,
    next_index: u32,
}

impl FramePacker {
    fn new(max_frame_size: usize) -> Self {
        let capacity = max_frame_size - HEADER_SIZE;
        Self {
            transfer_id: TransferId::generate(),
            capacity,
            staging: BytesMut::with_capacity(capacity),
            next_index: METADATA_INDEX + 1,
        }
    }

    fn metadata_frame(&self, metadata: Option<&serde_json::Value>) -> Result<Bytes, ChunkError> {
        let json = match metadata {
            Some(value) => serde_json::to_vec(value).map_err(|e| ChunkError::Metadata(e.to_string()))?,
            None => b"null".to_vec(),
        };
        let header = ChunkHeader::new(self.transfer_id, METADATA_INDEX, false);
        let mut frame = BytesMut::with_capacity(HEADER_SIZE + json.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&json);
        Ok(frame.freeze())
    }

    fn push(&mut self, mut data: Bytes, ready: &mut VecDeque<Bytes>) {
        while !data.is_empty() {
            if self.staging.len() == self.capacity {
                ready.push_back(self.flush(false));
            }
            let take = (self.capacity - self.staging.len()).min(data.len());
            self.staging.extend_from_slice(&data.split_to(take));
        }
    }

    fn finish(&mut self) -> Bytes {
        self.flush(true)
    }

    fn flush(&mut self, is_final: bool) -> Bytes {
        let header = ChunkHeader::new(self.transfer_id, self.next_index, is_final);
        let mut frame = BytesMut::with_capacity(HEADER_SIZE + self.staging.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&self.staging);
        self.staging.clear();
        self.next_index += 1;
        frame.freeze()
    }
}

// ── Buffer mode ──────────────────────────────────────────────────────────────

/// Iterator over the frames of one transfer.
pub struct Frames<I> {
    packer: FramePacker,
    metadata: Option<Bytes>,
    source: Option<I>,
    ready: VecDeque<Bytes>,
}

impl<I: Iterator<Item = Bytes>> Frames<I> {
    fn new(max_frame_size: usize, source: I, metadata: Option<&serde_json::Value>) -> Result<Self, ChunkError> {
        let packer = FramePacker::new(max_frame_size);
        let metadata = packer.metadata_frame(metadata)?;
        Ok(Self {
            packer,
            metadata: Some(metadata),
            source: Some(source),
            ready: VecDeque::new(),
        })
    }

    pub fn transfer_id(&self) -> TransferId {
        self.packer.transfer_id
    }
}

impl<I: Iterator<Item = Bytes>> Iterator for Frames<I> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if let Some(frame) = self.metadata.take() {
            return Some(frame);
        }
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(frame);
            }
            let source = self.source.as_mut()?;
            match source.next() {
                Some(bytes) => self.packer.push(bytes, &mut self.ready),
                None => {
                    self.source = None;
                    self.ready.push_back(self.packer.finish());
                }
            }
        }
    }
}

// ── Stream mode ──────────────────────────────────────────────────────────────

/// Async stream over the frames of one transfer fed by a live producer.
pub struct FrameStream<S> {
    packer: FramePacker,
    metadata: Option<Bytes>,
    source: Option<S>,
    ready: VecDeque<Bytes>,
}

impl<S> FrameStream<S> {
    fn new(max_frame_size: usize, source: S, metadata: Option<&serde_json::Value>) -> Result<Self, ChunkError> {
        let packer = FramePacker::new(max_frame_size);
        let metadata = packer.metadata_frame(metadata)?;
        Ok(Self {
            packer,
            metadata: Some(metadata),
            source: Some(source),
            ready: VecDeque::new(),
        })
    }

    pub fn transfer_id(&self) -> TransferId {
        self.packer.transfer_id
    }
}

impl<S, E> Stream for FrameStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(frame) = this.metadata.take() {
            return Poll::Ready(Some(Ok(frame)));
        }
        loop {
            if let Some(frame) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            let Some(source) = this.source.as_mut() else {
                return Poll::Ready(None);
            };
            match ready!(source.poll_next_unpin(cx)) {
                Some(Ok(bytes)) => this.packer.push(bytes, &mut this.ready),
                Some(Err(e)) => {
                    this.source = None;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.source = None;
                    this.ready.push_back(this.packer.finish());
                }
            }
        }
    }
}
