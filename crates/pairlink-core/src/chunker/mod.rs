//! Binary chunker — framing and reassembly for the binary channel.
//!
//! Senders turn a buffer or a live byte stream into frames no larger than
//! the configured maximum. Receivers rebuild transfers from frames arriving
//! in any order, either as one buffer on completion or, once promoted, as
//! an in-order byte stream. The chunker knows nothing about transports or
//! connection state.
//!
//! Every pending transfer carries a cleanup timer that is re-armed on each
//! frame. A transfer that goes quiet for longer than the timeout is dropped
//! and its id is reported on the timeout channel returned by
//! [`BinaryChunker::new`].

mod receive;
mod send;
mod stream;

pub use receive::Received;
pub use send::{FrameStream, Frames};
pub use stream::TransferStream;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ChunkerConfig;
use crate::wire::{TransferId, WireError, HEADER_SIZE};

use receive::PendingAssembly;
use stream::PendingStream;

/// Receiving half of the timeout notifications.
pub type TimeoutReceiver = mpsc::UnboundedReceiver<TransferId>;

/// Splits outgoing payloads into frames and reassembles incoming ones.
///
/// Receive-side operations arm timers with `tokio::spawn` and must run
/// inside a Tokio runtime.
pub struct BinaryChunker {
    max_frame_size: usize,
    timeout: Duration,
    tables: Arc<Mutex<Tables>>,
    timed_out: mpsc::UnboundedSender<TransferId>,
}

/// Per-transfer receive state. Entries move from `assemblies` to `streams`
/// on promotion and are removed on completion, timeout, or cancellation.
/// A cancelled stream leaves its id in `cancelled` so that frames still in
/// flight are dropped instead of starting a new assembly.
#[derive(Default)]
struct Tables {
    assemblies: HashMap<TransferId, PendingAssembly>,
    streams: HashMap<TransferId, PendingStream>,
    cancelled: HashMap<TransferId, Instant>,
    next_epoch: u64,
    timeout: Duration,
}

impl Tables {
    fn cancel_stream(&mut self, id: TransferId) -> bool {
        let removed = self.streams.remove(&id).is_some();
        if removed {
            self.cancelled.insert(id, Instant::now() + self.timeout);
        }
        removed
    }

    /// Whether frames for `id` belong to a cancelled stream. Each dropped
    /// frame extends the quiet period the same way a live transfer's would.
    fn is_cancelled(&mut self, id: TransferId) -> bool {
        let now = Instant::now();
        self.cancelled.retain(|_, until| *until > now);
        match self.cancelled.get_mut(&id) {
            Some(until) => {
                *until = now + self.timeout;
                true
            }
            None => false,
        }
    }
}

/// Cleanup timer for one pending transfer. Dropping it disarms the timer.
struct TransferTimer {
    epoch: u64,
    handle: JoinHandle<()>,
}

impl Drop for TransferTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl BinaryChunker {
    /// Create a chunker. Fails if `max_frame_size` leaves no room for payload.
    pub fn new(config: &ChunkerConfig) -> Result<(Self, TimeoutReceiver), ChunkError> {
        if config.max_frame_size <= HEADER_SIZE {
            return Err(ChunkError::FrameSizeTooSmall(config.max_frame_size));
        }
        let (timed_out, timeout_rx) = mpsc::unbounded_channel();
        let chunker = Self {
            max_frame_size: config.max_frame_size,
            timeout: config.transfer_timeout(),
            tables: Arc::new(Mutex::new(Tables {
                timeout: config.transfer_timeout(),
                ..Tables::default()
            })),
            timed_out,
        };
        Ok((chunker, timeout_rx))
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Number of transfers currently buffered or streaming.
    pub fn pending_transfers(&self) -> usize {
        let tables = lock(&self.tables);
        tables.assemblies.len() + tables.streams.len()
    }

    /// Discard every pending transfer. Open streams end with `Cancelled`.
    pub fn clear(&self) {
        let (assemblies, streams) = {
            let mut tables = lock(&self.tables);
            tables.cancelled.clear();
            (
                std::mem::take(&mut tables.assemblies),
                std::mem::take(&mut tables.streams),
            )
        };
        if !assemblies.is_empty() || !streams.is_empty() {
            tracing::debug!(
                assemblies = assemblies.len(),
                streams = streams.len(),
                "discarding pending transfers"
            );
        }
        for (id, stream) in streams {
            stream.fail(ChunkError::Cancelled(id));
        }
    }

    /// Arm a fresh timer for `id`. The caller stores it on the entry,
    /// which disarms whatever timer was there before.
    fn arm_timer(&self, tables: &mut Tables, id: TransferId) -> TransferTimer {
        tables.next_epoch += 1;
        let epoch = tables.next_epoch;
        let weak = Arc::downgrade(&self.tables);
        let timed_out = self.timed_out.clone();
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&weak, id, epoch, &timed_out);
        });
        TransferTimer { epoch, handle }
    }
}

/// Timer body: drop the entry if the timer that fired is still its current one.
fn expire(
    tables: &Weak<Mutex<Tables>>,
    id: TransferId,
    epoch: u64,
    timed_out: &mpsc::UnboundedSender<TransferId>,
) {
    let Some(tables) = tables.upgrade() else {
        return;
    };
    let mut tables = lock(&tables);

    let fired = if tables.assemblies.get(&id).is_some_and(|a| a.timer.epoch == epoch) {
        tables.assemblies.remove(&id);
        tracing::warn!(transfer_id = %id, "pending assembly timed out, discarding");
        true
    } else if tables.streams.get(&id).is_some_and(|s| s.timer.epoch == epoch) {
        if let Some(stream) = tables.streams.remove(&id) {
            stream.fail(ChunkError::TimedOut(id));
        }
        tracing::warn!(transfer_id = %id, "pending stream timed out, discarding");
        true
    } else {
        false
    };
    drop(tables);

    if fired {
        let _ = timed_out.send(id);
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("max frame size {0} must exceed the {HEADER_SIZE}-byte chunk header")]
    FrameSizeTooSmall(usize),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("no pending assembly for transfer {0}")]
    UnknownTransfer(TransferId),

    #[error("failed to encode transfer metadata: {0}")]
    Metadata(String),

    #[error("transfer {0} timed out")]
    TimedOut(TransferId),

    #[error("transfer {0} was cancelled")]
    Cancelled(TransferId),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
