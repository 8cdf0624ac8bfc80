//! Peer transport capability.
//!
//! A transport creates connections; a connection carries named, ordered,
//! reliable message channels. Implementations push state changes, trickled
//! ICE candidates and remotely opened channels through `events()`.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use pairlink_core::config::IceServer;

pub type EventStream<T> = BoxStream<'static, T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// No further transitions will happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Closed,
    /// Buffered amount fell to or below the low threshold.
    BufferedAmountLow,
}

#[derive(Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// Local candidate to trickle to the remote side.
    IceCandidate(IceCandidate),
    /// Channel opened by the remote side.
    DataChannel(Arc<dyn DataChannel>),
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            ConnectionEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            ConnectionEvent::DataChannel(ch) => f.debug_tuple("DataChannel").field(&ch.label()).finish(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_connection(&self, ice_servers: &[IceServer]) -> Result<Arc<dyn PeerConnection>, TransportError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open a named channel from this side.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer to the installed remote offer and install it locally.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn state(&self) -> ConnectionState;

    /// Subscribe to events raised after this call.
    fn events(&self) -> EventStream<ConnectionEvent>;

    /// Close every channel and the connection. Closing twice is a no-op.
    async fn close(&self);
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> ChannelState;

    /// Bytes queued locally and not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError>;

    /// Subscribe to state and drain events raised after this call.
    fn events(&self) -> EventStream<ChannelEvent>;

    /// Inbound messages. Messages that arrive before the first call are
    /// held and delivered to it; a later call takes over from the previous one.
    /// The stream ends once the channel has closed and every message that
    /// arrived before the close has been yielded.
    fn messages(&self) -> EventStream<ChannelMessage>;

    /// Closing an already closed channel is a no-op.
    async fn close(&self);
}

/// Fan-out list of event subscribers. Dropped receivers are pruned on publish.
pub struct Subscribers<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone + Send + 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx.boxed()
    }

    pub fn publish(&self, item: T) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.unbounded_send(item.clone()).is_ok());
    }

    /// End every subscriber's stream.
    pub fn close(&self) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<T: Clone + Send + 'static> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("channel {0} is not open")]
    ChannelNotOpen(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("no remote description has been set")]
    NoRemoteDescription,

    #[error("transport failure: {0}")]
    Failed(String),
}
