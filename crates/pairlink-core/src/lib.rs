//! pairlink-core — wire format, binary chunker, and configuration.
//! Nothing here knows about signaling or peer connections.

pub mod chunker;
pub mod config;
pub mod wire;

pub use chunker::{BinaryChunker, ChunkError, Received, TransferStream};
pub use wire::{ControlMessage, FileMetadata, TransferId};
