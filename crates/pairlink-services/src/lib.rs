//! pairlink-services — peer sessions and the connection manager.
//!
//! Signaling and the peer transport are capabilities supplied by the
//! caller (`Signaler`, `Transport`). The `loopback` module provides
//! in-process implementations of both.

pub mod backpressure;
pub mod events;
pub mod loopback;
pub mod manager;
pub mod scope;
pub mod session;
pub mod signaler;
pub mod transport;

pub use events::{names, ListenerId};
pub use manager::{ConnectionManager, ConnectionRequest, ManagerEvent, NegotiationError};
pub use session::{OutgoingFile, PeerSession, ReceivedFile, SessionError, SessionEvent};
pub use signaler::{PeerId, SignalEvent, Signaler, SignalingError};
pub use transport::{DataChannel, PeerConnection, Transport, TransportError};
