//! Pairlink wire format — everything that crosses a logical channel.
//!
//! Two channels are multiplexed over one negotiated transport:
//!
//!   control — UTF-8 JSON `{"event": string, "args": array}` text messages
//!   binary  — frames of `ChunkHeader` followed by a payload
//!
//! Frame index 0 of every transfer carries UTF-8 JSON metadata (or the
//! literal `null`). Indices 1.. carry payload bytes in order. Changing any
//! size or offset here breaks compatibility with existing peers.

use std::fmt;

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Chunk Header ─────────────────────────────────────────────────────────────

/// Fixed header at the front of every binary frame.
///
/// Wire size: 21 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkHeader {
    /// Raw 16-byte transfer identifier (not hyphenated text).
    pub transfer_id: [u8; 16],

    /// Position of this frame within its transfer. 0 is always metadata.
    pub chunk_index: U32<BigEndian>,

    /// 1 on the last frame of a transfer, 0 otherwise.
    pub is_final: u8,
}

assert_eq_size!(ChunkHeader, [u8; HEADER_SIZE]);

/// Size of `ChunkHeader` on the wire. Any configured frame size must exceed it.
pub const HEADER_SIZE: usize = 21;

/// Chunk index reserved for the metadata frame.
pub const METADATA_INDEX: u32 = 0;

impl ChunkHeader {
    pub fn new(transfer_id: TransferId, chunk_index: u32, is_final: bool) -> Self {
        Self {
            transfer_id: transfer_id.0,
            chunk_index: U32::new(chunk_index),
            is_final: u8::from(is_final),
        }
    }

    /// Parse the header at the front of `frame`.
    pub fn parse(frame: &[u8]) -> Result<Self, WireError> {
        Self::read_from_prefix(frame).ok_or(WireError::FrameTooShort(frame.len()))
    }

    pub fn id(&self) -> TransferId {
        TransferId(self.transfer_id)
    }

    pub fn index(&self) -> u32 {
        self.chunk_index.get()
    }

    /// Any non-zero flag byte is treated as final.
    pub fn is_final(&self) -> bool {
        self.is_final != 0
    }
}

// ── Transfer identifier ──────────────────────────────────────────────────────

/// Identifies one logical send (buffer or stream) across all of its frames.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub [u8; 16]);

impl TransferId {
    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", hex::encode(self.0))
    }
}

// ── Control envelope ─────────────────────────────────────────────────────────

/// JSON envelope for every control-channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub event: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl ControlMessage {
    pub fn new(event: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }

    /// The goodbye sent as the first phase of a close handshake.
    pub fn goodbye() -> Self {
        Self::new(CLOSE_EVENT, Vec::new())
    }

    pub fn is_goodbye(&self) -> bool {
        self.event == CLOSE_EVENT
    }
}

/// Control event reserved for the close handshake. Never surfaced to listeners.
pub const CLOSE_EVENT: &str = "__pairlink_close";

// ── File metadata ────────────────────────────────────────────────────────────

/// Metadata shape that marks a transfer as a file.
///
/// Detection is structural: a metadata object is a file exactly when its
/// `__pairlinkFile` field is `true` and the remaining fields decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(rename = "__pairlinkFile")]
    pub marker: bool,
    pub name: String,
    /// MIME type, e.g. `text/plain`. Empty when unknown.
    #[serde(rename = "type", default)]
    pub mime_type: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub last_modified: u64,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, size: u64, last_modified: u64) -> Self {
        Self {
            marker: true,
            name: name.into(),
            mime_type: mime_type.into(),
            size,
            last_modified,
        }
    }

    /// Recognise the reserved file shape inside decoded transfer metadata.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        if value.get("__pairlinkFile").and_then(serde_json::Value::as_bool) != Some(true) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> serde_json::Value {
        // Plain struct of strings and integers; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame of {0} bytes is shorter than the {HEADER_SIZE}-byte chunk header")]
    FrameTooShort(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
