//! Signaling capability — carries offers, answers and ICE candidates
//! between peers in a room before a direct transport exists.
//!
//! Sends are fire-and-forget. Deliveries are pushed through `subscribe()`.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::transport::{EventStream, IceCandidate, SessionDescription};

/// Identity of a peer within a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A random 16-hex-digit identity.
    pub fn random() -> Self {
        Self(hex::encode(rand::random::<[u8; 8]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    Offer { from: PeerId, offer: SessionDescription },
    Answer { from: PeerId, answer: SessionDescription },
    IceCandidate { from: PeerId, candidate: IceCandidate },
    /// The remote side declined our offer.
    ConnectionRejected { from: PeerId },
}

impl SignalEvent {
    pub fn from(&self) -> &PeerId {
        match self {
            SignalEvent::Offer { from, .. }
            | SignalEvent::Answer { from, .. }
            | SignalEvent::IceCandidate { from, .. }
            | SignalEvent::ConnectionRejected { from } => from,
        }
    }
}

#[async_trait]
pub trait Signaler: Send + Sync {
    /// Join `room` and return the identity assigned to this side.
    async fn connect_to_room(&self, room: &str) -> Result<PeerId, SignalingError>;

    async fn send_offer(&self, to: &PeerId, offer: SessionDescription) -> Result<(), SignalingError>;

    async fn send_answer(&self, to: &PeerId, answer: SessionDescription) -> Result<(), SignalingError>;

    async fn send_ice_candidate(&self, to: &PeerId, candidate: IceCandidate) -> Result<(), SignalingError>;

    async fn reject_offer(&self, to: &PeerId) -> Result<(), SignalingError>;

    /// Identities currently in the room, this side excluded.
    async fn get_room_peers(&self) -> Result<Vec<PeerId>, SignalingError>;

    /// Subscribe to signals delivered after this call.
    fn subscribe(&self) -> EventStream<SignalEvent>;

    async fn close(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    #[error("not connected to a room")]
    NotInRoom,

    #[error("already connected to room {0}")]
    AlreadyInRoom(String),

    #[error("peer {0} is not in the room")]
    UnknownPeer(PeerId),

    #[error("signaler is closed")]
    Closed,
}
