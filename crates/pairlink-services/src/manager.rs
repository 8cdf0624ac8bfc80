//! Connection manager — turns signaling into established peer sessions.
//!
//! Per remote identity: absent → pending → established → closed, with
//! `failed` reachable only from pending. A peer is promoted exactly when its
//! connection reports connected *and* both channels are open; the two
//! signals arrive independently and in either order.
//!
//! Each pending peer owns two scopes. The negotiation scope covers
//! handshake-only subscriptions (answer, rejection, channel-open waits) and
//! is retired at promotion. The lifetime scope covers ICE trickling and
//! connection events and is retired when the session closes.
//!
//! Remote candidates for an inbound offer are queued from the moment the
//! offer arrives and drained into the answering connection once it has the
//! remote description, so nothing trickled during setup is lost.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;

use pairlink_core::config::PairlinkConfig;

use crate::events::{names, ListenerId, Listeners};
use crate::scope::Scope;
use crate::session::{CloseCallback, PeerSession, SessionTransport};
use crate::signaler::{PeerId, SignalEvent, Signaler, SignalingError};
use crate::transport::{
    ChannelEvent, ChannelState, ConnectionEvent, ConnectionState, DataChannel, EventStream, IceCandidate,
    PeerConnection, SessionDescription, Transport, TransportError,
};

pub const CONTROL_CHANNEL: &str = "control";
pub const BINARY_CHANNEL: &str = "binary";

/// Payload handed to manager listeners.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Connected(PeerSession),
    ConnectionRequest(ConnectionRequest),
    ConnectionFailed(PeerId),
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    signaler: Arc<dyn Signaler>,
    transport: Arc<dyn Transport>,
    config: PairlinkConfig,
    local_id: OnceLock<PeerId>,
    /// Peers being negotiated. Entries leave at promotion or failure.
    peers: DashMap<PeerId, PeerState>,
    sessions: DashMap<PeerId, PeerSession>,
    /// Candidate queues for inbound offers, from the offer until the
    /// request is dropped, rejected, or its peer goes away.
    inbound: DashMap<PeerId, InboundRoute>,
    next_request: AtomicU64,
    listeners: Listeners<ManagerEvent>,
    /// Room-level signal subscription.
    scope: Scope,
    closed: AtomicBool,
}

struct InboundRoute {
    generation: u64,
    candidates: mpsc::UnboundedSender<IceCandidate>,
    accepted: bool,
}

struct PeerState {
    connection: Arc<dyn PeerConnection>,
    control: Option<Arc<dyn DataChannel>>,
    binary: Option<Arc<dyn DataChannel>>,
    negotiation: Scope,
    lifetime: Scope,
}

impl PeerState {
    fn new(connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            connection,
            control: None,
            binary: None,
            negotiation: Scope::new(),
            lifetime: Scope::new(),
        }
    }

    fn is_ready(&self) -> bool {
        let open = |channel: &Option<Arc<dyn DataChannel>>| {
            channel
                .as_ref()
                .is_some_and(|c| c.state() == ChannelState::Open)
        };
        self.connection.state() == ConnectionState::Connected && open(&self.control) && open(&self.binary)
    }
}

impl ConnectionManager {
    pub fn new(signaler: Arc<dyn Signaler>, transport: Arc<dyn Transport>, config: PairlinkConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                signaler,
                transport,
                config,
                local_id: OnceLock::new(),
                peers: DashMap::new(),
                sessions: DashMap::new(),
                inbound: DashMap::new(),
                next_request: AtomicU64::new(0),
                listeners: Listeners::new(),
                scope: Scope::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Join the configured room and start answering signals.
    pub async fn connect_to_room(&self) -> Result<PeerId, NegotiationError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let room = inner.config.signaling.room.as_str();
        if inner.local_id.get().is_some() {
            return Err(SignalingError::AlreadyInRoom(room.to_string()).into());
        }

        // Subscribe first so no offer slips in between joining and listening.
        let signals = inner.signaler.subscribe();
        let local_id = inner.signaler.connect_to_room(room).await?;
        let _ = inner.local_id.set(local_id.clone());
        inner.scope.spawn(dispatch_signals(Arc::downgrade(inner), signals));

        tracing::info!(room, local_id = %local_id, "joined room");
        Ok(local_id)
    }

    /// Start negotiating with `remote`. `connected` fires once the session
    /// is ready; `connectionFailed` if negotiation fails later on.
    pub async fn connect_to_peer(&self, remote: &PeerId) -> Result<(), NegotiationError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        if inner.local_id.get().is_none() {
            return Err(NegotiationError::NotInRoom);
        }
        inner.ensure_absent(remote)?;

        let connection = inner
            .transport
            .create_connection(&inner.config.transport.ice_servers)
            .await?;
        let mut state = PeerState::new(connection.clone());
        let channels = async {
            let control = connection.create_data_channel(CONTROL_CHANNEL).await?;
            let binary = connection.create_data_channel(BINARY_CHANNEL).await?;
            Ok::<_, TransportError>((control, binary))
        };
        let (control, binary) = match channels.await {
            Ok(channels) => channels,
            Err(e) => {
                connection.close().await;
                return Err(e.into());
            }
        };
        state.control = Some(control.clone());
        state.binary = Some(binary.clone());
        let negotiation = state.negotiation.clone();
        let lifetime = state.lifetime.clone();
        inner.insert_peer(remote, state).await?;

        let weak = Arc::downgrade(inner);
        lifetime.spawn(watch_connection(weak.clone(), remote.clone(), connection.events()));
        lifetime.spawn(apply_remote_candidates(remote.clone(), inner.signaler.subscribe(), connection.clone()));
        negotiation.spawn(await_answer(weak.clone(), remote.clone(), inner.signaler.subscribe(), connection.clone()));
        negotiation.spawn(wait_channel_open(weak.clone(), remote.clone(), control));
        negotiation.spawn(wait_channel_open(weak, remote.clone(), binary));

        let offer = async {
            let offer = connection.create_offer().await?;
            inner.signaler.send_offer(remote, offer).await?;
            Ok::<_, NegotiationError>(())
        };
        if let Err(e) = offer.await {
            inner.discard(remote).await;
            return Err(e);
        }

        tracing::info!(peer = %remote, "offer sent");
        Ok(())
    }

    pub async fn get_room_peers(&self) -> Result<Vec<PeerId>, NegotiationError> {
        self.inner.ensure_open()?;
        Ok(self.inner.signaler.get_room_peers().await?)
    }

    pub fn on<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(ManagerEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.on(event, handler)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.listeners.off(event, id)
    }

    /// Close every session, abandon pending negotiations, and leave the room.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.scope.cancel();

        let sessions: Vec<PeerSession> = inner.sessions.iter().map(|entry| entry.value().clone()).collect();
        for session in sessions {
            session.close().await;
        }
        let pending: Vec<PeerId> = inner.peers.iter().map(|entry| entry.key().clone()).collect();
        for remote in pending {
            inner.discard(&remote).await;
        }
        inner.inbound.clear();
        inner.signaler.close().await;
        inner.listeners.clear();

        tracing::info!("connection manager closed");
    }

    /// Identity assigned by the signaler, once in a room.
    pub fn local_id(&self) -> Option<&PeerId> {
        self.inner.local_id.get()
    }

    pub fn session(&self, remote: &PeerId) -> Option<PeerSession> {
        self.inner.sessions.get(remote).map(|entry| entry.value().clone())
    }

    pub fn sessions(&self) -> Vec<PeerSession> {
        self.inner.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn is_pending(&self, remote: &PeerId) -> bool {
        self.inner.peers.contains_key(remote)
    }
}

impl ManagerInner {
    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    fn ensure_absent(&self, remote: &PeerId) -> Result<(), NegotiationError> {
        if self.sessions.contains_key(remote) {
            return Err(NegotiationError::AlreadyConnected(remote.clone()));
        }
        if self.peers.contains_key(remote) {
            return Err(NegotiationError::AlreadyPending(remote.clone()));
        }
        Ok(())
    }

    /// Record a pending peer, or close its connection if one raced in first.
    async fn insert_peer(&self, remote: &PeerId, state: PeerState) -> Result<(), NegotiationError> {
        let taken = if self.sessions.contains_key(remote) {
            NegotiationError::AlreadyConnected(remote.clone())
        } else {
            match self.peers.entry(remote.clone()) {
                Entry::Occupied(_) => NegotiationError::AlreadyPending(remote.clone()),
                Entry::Vacant(slot) => {
                    slot.insert(state);
                    return Ok(());
                }
            }
        };
        state.connection.close().await;
        Err(taken)
    }

    async fn handle_offer(self: &Arc<Self>, from: PeerId, offer: SessionDescription) {
        let answering = self.inbound.get(&from).is_some_and(|route| route.accepted);
        if answering || self.peers.contains_key(&from) || self.sessions.contains_key(&from) {
            tracing::warn!(peer = %from, "offer from a peer already pending or connected, rejecting");
            self.reject(&from).await;
            return;
        }
        if self.listeners.count(names::CONNECTION_REQUEST) == 0 {
            tracing::info!(peer = %from, "no connectionRequest listener, rejecting offer");
            self.reject(&from).await;
            return;
        }

        let generation = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (candidates, queued) = mpsc::unbounded_channel();
        let route = InboundRoute {
            generation,
            candidates,
            accepted: false,
        };
        if let Some(stale) = self.inbound.insert(from.clone(), route) {
            tracing::debug!(peer = %from, generation = stale.generation, "unanswered request superseded by a new offer");
        }

        tracing::info!(peer = %from, "connection requested");
        let request = ConnectionRequest {
            state: Arc::new(RequestState {
                manager: Arc::downgrade(self),
                remote_id: from,
                generation,
                offer,
                candidates: Mutex::new(Some(queued)),
                answered: AtomicBool::new(false),
            }),
        };
        self.listeners
            .emit(names::CONNECTION_REQUEST, ManagerEvent::ConnectionRequest(request));
    }

    async fn reject(&self, remote: &PeerId) {
        if let Err(e) = self.signaler.reject_offer(remote).await {
            tracing::warn!(peer = %remote, error = %e, "failed to send rejection");
        }
    }

    /// Remove the candidate route of one particular request.
    fn release_request(&self, remote: &PeerId, generation: u64) -> bool {
        self.inbound
            .remove_if(remote, |_, route| route.generation == generation)
            .is_some()
    }

    /// Remove the candidate route of an answered request, if any.
    fn release_route(&self, remote: &PeerId) {
        self.inbound.remove_if(remote, |_, route| route.accepted);
    }

    async fn accept_offer(self: &Arc<Self>, request: &RequestState) -> Result<(), NegotiationError> {
        let remote = &request.remote_id;
        self.ensure_open()?;
        match self
            .inbound
            .get_mut(remote)
            .filter(|route| route.generation == request.generation)
        {
            Some(mut route) => route.accepted = true,
            None => return Err(NegotiationError::Superseded(remote.clone())),
        }
        let queued = request
            .candidates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let setup = async {
            self.ensure_absent(remote)?;
            let connection = self
                .transport
                .create_connection(&self.config.transport.ice_servers)
                .await?;
            let state = PeerState::new(connection.clone());
            let lifetime = state.lifetime.clone();
            self.insert_peer(remote, state).await?;
            Ok::<_, NegotiationError>((connection, lifetime))
        };
        let (connection, lifetime) = match setup.await {
            Ok(setup) => setup,
            Err(e) => {
                self.release_request(remote, request.generation);
                return Err(e);
            }
        };
        lifetime.spawn(watch_connection(Arc::downgrade(self), remote.clone(), connection.events()));

        let answer = async {
            connection.set_remote_description(request.offer.clone()).await?;
            if let Some(queued) = queued {
                lifetime.spawn(apply_queued_candidates(remote.clone(), queued, connection.clone()));
            }
            let answer = connection.create_answer().await?;
            self.signaler.send_answer(remote, answer).await?;
            Ok::<_, NegotiationError>(())
        };
        if let Err(e) = answer.await {
            self.discard(remote).await;
            return Err(e);
        }

        tracing::info!(peer = %remote, "offer accepted, answer sent");
        Ok(())
    }

    /// Record a channel the remote side opened and wait for it to be ready.
    fn adopt_channel(self: &Arc<Self>, remote: &PeerId, channel: Arc<dyn DataChannel>) {
        let negotiation = {
            let Some(mut peer) = self.peers.get_mut(remote) else {
                tracing::debug!(peer = %remote, label = channel.label(), "channel for a peer that is not pending");
                return;
            };
            match channel.label() {
                CONTROL_CHANNEL => peer.control = Some(channel.clone()),
                BINARY_CHANNEL => peer.binary = Some(channel.clone()),
                other => {
                    tracing::debug!(peer = %remote, label = other, "ignoring unexpected channel");
                    return;
                }
            }
            peer.negotiation.clone()
        };
        negotiation.spawn(wait_channel_open(Arc::downgrade(self), remote.clone(), channel));
    }

    /// Hand a ready peer to a new session. Only the caller that removes the
    /// pending entry gets past the first line, so `connected` fires once.
    fn try_promote(self: &Arc<Self>, remote: &PeerId) {
        let Some((_, peer)) = self.peers.remove_if(remote, |_, peer| peer.is_ready()) else {
            return;
        };
        peer.negotiation.cancel();
        let PeerState {
            connection,
            control,
            binary,
            lifetime,
            ..
        } = peer;
        let (Some(control), Some(binary)) = (control, binary) else {
            return;
        };

        let weak = Arc::downgrade(self);
        let session_lifetime = lifetime.clone();
        let on_close: CloseCallback = Box::new(move |remote: &PeerId| {
            session_lifetime.cancel();
            if let Some(inner) = weak.upgrade() {
                inner.release_route(remote);
                inner.sessions.remove(remote);
            }
        });
        let transport = SessionTransport {
            connection: connection.clone(),
            control,
            binary,
        };

        match PeerSession::new(remote.clone(), transport, &self.config, Some(on_close)) {
            Ok(session) => {
                self.sessions.insert(remote.clone(), session.clone());
                if session.is_closed() {
                    self.sessions.remove(remote);
                }
                tracing::info!(peer = %remote, "peer connected");
                self.listeners.emit(names::CONNECTED, ManagerEvent::Connected(session));
            }
            Err(e) => {
                tracing::warn!(peer = %remote, error = %e, "failed to start session");
                self.release_route(remote);
                lifetime.cancel();
                tokio::spawn(async move { connection.close().await });
                self.listeners
                    .emit(names::CONNECTION_FAILED, ManagerEvent::ConnectionFailed(remote.clone()));
            }
        }
    }

    /// pending → failed.
    fn fail(&self, remote: &PeerId) {
        let Some((_, peer)) = self.peers.remove(remote) else {
            return;
        };
        peer.negotiation.cancel();
        peer.lifetime.cancel();
        self.release_route(remote);
        let connection = peer.connection;
        tokio::spawn(async move { connection.close().await });

        tracing::warn!(peer = %remote, "connection failed");
        self.listeners
            .emit(names::CONNECTION_FAILED, ManagerEvent::ConnectionFailed(remote.clone()));
    }

    /// Drop a pending peer without reporting it.
    async fn discard(&self, remote: &PeerId) {
        let Some((_, peer)) = self.peers.remove(remote) else {
            return;
        };
        peer.negotiation.cancel();
        peer.lifetime.cancel();
        self.release_route(remote);
        peer.connection.close().await;
        tracing::debug!(peer = %remote, "pending negotiation discarded");
    }
}

// ── Subscription tasks ───────────────────────────────────────────────────────

/// Room-level signals: offers, and candidates for inbound offers.
async fn dispatch_signals(manager: Weak<ManagerInner>, mut signals: EventStream<SignalEvent>) {
    while let Some(signal) = signals.next().await {
        let Some(inner) = manager.upgrade() else {
            return;
        };
        match signal {
            SignalEvent::Offer { from, offer } => inner.handle_offer(from, offer).await,
            SignalEvent::IceCandidate { from, candidate } => {
                if let Some(route) = inner.inbound.get(&from) {
                    let _ = route.candidates.send(candidate);
                }
            }
            // per-peer subscriptions handle the rest
            SignalEvent::Answer { .. } | SignalEvent::ConnectionRejected { .. } => {}
        }
    }
}

async fn await_answer(
    manager: Weak<ManagerInner>,
    remote: PeerId,
    mut signals: EventStream<SignalEvent>,
    connection: Arc<dyn PeerConnection>,
) {
    while let Some(signal) = signals.next().await {
        match signal {
            SignalEvent::Answer { from, answer } if from == remote => {
                if let Err(e) = connection.set_remote_description(answer).await {
                    tracing::warn!(peer = %remote, error = %e, "failed to apply answer");
                    if let Some(inner) = manager.upgrade() {
                        inner.fail(&remote);
                    }
                }
                return;
            }
            SignalEvent::ConnectionRejected { from } if from == remote => {
                tracing::info!(peer = %remote, "offer rejected");
                if let Some(inner) = manager.upgrade() {
                    inner.fail(&remote);
                }
                return;
            }
            _ => {}
        }
    }
}

async fn apply_remote_candidates(
    remote: PeerId,
    mut signals: EventStream<SignalEvent>,
    connection: Arc<dyn PeerConnection>,
) {
    while let Some(signal) = signals.next().await {
        if let SignalEvent::IceCandidate { from, candidate } = signal {
            if from != remote {
                continue;
            }
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                tracing::debug!(peer = %remote, error = %e, "remote candidate rejected");
            }
        }
    }
}

async fn apply_queued_candidates(
    remote: PeerId,
    mut queued: mpsc::UnboundedReceiver<IceCandidate>,
    connection: Arc<dyn PeerConnection>,
) {
    while let Some(candidate) = queued.recv().await {
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            tracing::debug!(peer = %remote, error = %e, "remote candidate rejected");
        }
    }
}

async fn watch_connection(manager: Weak<ManagerInner>, remote: PeerId, mut events: EventStream<ConnectionEvent>) {
    while let Some(event) = events.next().await {
        let Some(inner) = manager.upgrade() else {
            return;
        };
        match event {
            ConnectionEvent::IceCandidate(candidate) => {
                if let Err(e) = inner.signaler.send_ice_candidate(&remote, candidate).await {
                    tracing::debug!(peer = %remote, error = %e, "failed to trickle candidate");
                }
            }
            ConnectionEvent::DataChannel(channel) => inner.adopt_channel(&remote, channel),
            ConnectionEvent::StateChanged(ConnectionState::Connected) => inner.try_promote(&remote),
            ConnectionEvent::StateChanged(state) if state.is_terminal() => inner.fail(&remote),
            ConnectionEvent::StateChanged(state) => {
                tracing::trace!(peer = %remote, ?state, "connection state changed");
            }
        }
    }
}

async fn wait_channel_open(manager: Weak<ManagerInner>, remote: PeerId, channel: Arc<dyn DataChannel>) {
    let mut events = channel.events();
    while channel.state() != ChannelState::Open {
        match events.next().await {
            Some(ChannelEvent::Open) => break,
            Some(ChannelEvent::Closed) | None => return,
            Some(ChannelEvent::BufferedAmountLow) => {}
        }
    }
    tracing::debug!(peer = %remote, label = channel.label(), "channel open");
    if let Some(inner) = manager.upgrade() {
        inner.try_promote(&remote);
    }
}

// ── Connection requests ──────────────────────────────────────────────────────

/// An inbound offer awaiting the application's decision. Dropping every
/// copy without answering rejects the offer.
#[derive(Clone)]
pub struct ConnectionRequest {
    state: Arc<RequestState>,
}

struct RequestState {
    manager: Weak<ManagerInner>,
    remote_id: PeerId,
    generation: u64,
    offer: SessionDescription,
    candidates: Mutex<Option<mpsc::UnboundedReceiver<IceCandidate>>>,
    answered: AtomicBool,
}

impl ConnectionRequest {
    pub fn remote_id(&self) -> &PeerId {
        &self.state.remote_id
    }

    /// Answer the offer. The session arrives later through `connected`.
    pub async fn accept(&self) -> Result<(), NegotiationError> {
        let state = &self.state;
        let inner = state.manager.upgrade().ok_or(NegotiationError::Closed)?;
        if state.answered.swap(true, Ordering::SeqCst) {
            return Err(NegotiationError::AlreadyAnswered(state.remote_id.clone()));
        }
        inner.accept_offer(state).await
    }

    pub async fn reject(&self) -> Result<(), NegotiationError> {
        let state = &self.state;
        let inner = state.manager.upgrade().ok_or(NegotiationError::Closed)?;
        if state.answered.swap(true, Ordering::SeqCst) {
            return Err(NegotiationError::AlreadyAnswered(state.remote_id.clone()));
        }
        if !inner.release_request(&state.remote_id, state.generation) {
            return Err(NegotiationError::Superseded(state.remote_id.clone()));
        }
        inner.signaler.reject_offer(&state.remote_id).await?;
        tracing::info!(peer = %state.remote_id, "connection request rejected");
        Ok(())
    }
}

impl Drop for RequestState {
    fn drop(&mut self) {
        if self.answered.load(Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        if !inner.release_request(&self.remote_id, self.generation) || inner.ensure_open().is_err() {
            return;
        }
        tracing::info!(peer = %self.remote_id, "connection request dropped unanswered, rejecting");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let remote = self.remote_id.clone();
            runtime.spawn(async move { inner.reject(&remote).await });
        }
    }
}

impl fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("remote_id", &self.state.remote_id)
            .field("answered", &self.state.answered.load(Ordering::SeqCst))
            .finish()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("not connected to a room")]
    NotInRoom,

    #[error("a connection to {0} is already being negotiated")]
    AlreadyPending(PeerId),

    #[error("already connected to {0}")]
    AlreadyConnected(PeerId),

    #[error("the request from {0} was already answered")]
    AlreadyAnswered(PeerId),

    #[error("the request from {0} was replaced by a newer offer")]
    Superseded(PeerId),

    #[error("connection manager is closed")]
    Closed,

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use pairlink_core::config::IceServer;

    use crate::loopback::{LoopbackNetwork, LoopbackSignalHub, LoopbackTransport};

    /// Loopback transport that takes a while to hand out connections.
    struct SlowTransport {
        inner: LoopbackTransport,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn create_connection(&self, ice_servers: &[IceServer]) -> Result<Arc<dyn PeerConnection>, TransportError> {
            tokio::time::sleep(self.delay).await;
            self.inner.create_connection(ice_servers).await
        }
    }

    fn manager(hub: &LoopbackSignalHub, network: &LoopbackNetwork, id: &str) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(hub.signaler_with_id(PeerId::from(id))),
            Arc::new(network.transport()),
            PairlinkConfig::default(),
        )
    }

    fn collect(manager: &ConnectionManager, event: &str) -> mpsc::UnboundedReceiver<ManagerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.on(event, move |e| {
            let _ = tx.send(e);
        });
        rx
    }

    fn auto_accept(manager: &ConnectionManager) {
        manager.on(names::CONNECTION_REQUEST, |event| {
            if let ManagerEvent::ConnectionRequest(request) = event {
                tokio::spawn(async move {
                    let _ = request.accept().await;
                });
            }
        });
    }

    async fn in_room(hub: &LoopbackSignalHub, network: &LoopbackNetwork, ids: [&str; 2]) -> (ConnectionManager, ConnectionManager) {
        let a = manager(hub, network, ids[0]);
        let b = manager(hub, network, ids[1]);
        a.connect_to_room().await.unwrap();
        b.connect_to_room().await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn connecting_requires_a_room() {
        let a = manager(&LoopbackSignalHub::new(), &LoopbackNetwork::new(), "alice");
        assert!(matches!(
            a.connect_to_peer(&PeerId::from("bob")).await,
            Err(NegotiationError::NotInRoom)
        ));
        a.connect_to_room().await.unwrap();
        assert!(matches!(
            a.connect_to_room().await,
            Err(NegotiationError::Signaling(SignalingError::AlreadyInRoom(_)))
        ));
        assert_eq!(a.local_id(), Some(&PeerId::from("alice")));
    }

    #[tokio::test]
    async fn accepted_offer_connects_both_sides_once() {
        let (hub, network) = (LoopbackSignalHub::new(), LoopbackNetwork::new());
        let (a, b) = in_room(&hub, &network, ["alice", "bob"]).await;
        auto_accept(&b);
        let mut a_connected = collect(&a, names::CONNECTED);
        let mut b_connected = collect(&b, names::CONNECTED);

        assert_eq!(a.get_room_peers().await.unwrap(), vec![PeerId::from("bob")]);
        a.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        assert!(a.is_pending(&PeerId::from("bob")));
        assert!(matches!(
            a.connect_to_peer(&PeerId::from("bob")).await,
            Err(NegotiationError::AlreadyPending(_))
        ));

        let Some(ManagerEvent::Connected(at_a)) = a_connected.recv().await else {
            panic!("alice never connected");
        };
        let Some(ManagerEvent::Connected(at_b)) = b_connected.recv().await else {
            panic!("bob never connected");
        };
        assert_eq!(at_a.remote_id(), &PeerId::from("bob"));
        assert_eq!(at_b.remote_id(), &PeerId::from("alice"));
        assert!(!a.is_pending(&PeerId::from("bob")));
        assert!(a.session(&PeerId::from("bob")).is_some());
        assert_eq!(b.sessions().len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(a_connected.try_recv().is_err());
        assert!(b_connected.try_recv().is_err());
        assert!(network.candidates_applied() > 0);

        assert!(matches!(
            a.connect_to_peer(&PeerId::from("bob")).await,
            Err(NegotiationError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn offers_without_a_request_listener_are_rejected() {
        let (hub, network) = (LoopbackSignalHub::new(), LoopbackNetwork::new());
        let (a, b) = in_room(&hub, &network, ["alice", "bob"]).await;
        let mut failed = collect(&a, names::CONNECTION_FAILED);

        a.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        assert!(matches!(
            failed.recv().await,
            Some(ManagerEvent::ConnectionFailed(peer)) if peer == PeerId::from("bob")
        ));
        assert!(!a.is_pending(&PeerId::from("bob")));
        assert!(b.sessions().is_empty());
    }

    #[tokio::test]
    async fn explicit_rejection_fails_the_offerer() {
        let (hub, network) = (LoopbackSignalHub::new(), LoopbackNetwork::new());
        let (a, b) = in_room(&hub, &network, ["alice", "bob"]).await;
        let mut requests = collect(&b, names::CONNECTION_REQUEST);
        let mut failed = collect(&a, names::CONNECTION_FAILED);

        a.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        let Some(ManagerEvent::ConnectionRequest(request)) = requests.recv().await else {
            panic!("bob never saw the request");
        };
        assert_eq!(request.remote_id(), &PeerId::from("alice"));
        request.reject().await.unwrap();
        assert!(matches!(
            request.accept().await,
            Err(NegotiationError::AlreadyAnswered(_))
        ));

        assert!(matches!(failed.recv().await, Some(ManagerEvent::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn candidates_trickled_during_a_slow_answer_are_applied() {
        let (hub, network) = (LoopbackSignalHub::new(), LoopbackNetwork::new());
        let alice_signaler = Arc::new(hub.signaler_with_id(PeerId::from("alice")));
        let a = ConnectionManager::new(alice_signaler.clone(), Arc::new(network.transport()), PairlinkConfig::default());
        let slow = SlowTransport {
            inner: network.transport(),
            delay: Duration::from_millis(50),
        };
        let b = ConnectionManager::new(
            Arc::new(hub.signaler_with_id(PeerId::from("bob"))),
            Arc::new(slow),
            PairlinkConfig::default(),
        );
        a.connect_to_room().await.unwrap();
        b.connect_to_room().await.unwrap();
        let mut requests = collect(&b, names::CONNECTION_REQUEST);
        auto_accept(&b);
        let mut a_connected = collect(&a, names::CONNECTED);
        let mut b_connected = collect(&b, names::CONNECTED);

        a.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        assert!(requests.recv().await.is_some());
        // bob is still waiting on its connection
        tokio::time::sleep(Duration::from_millis(10)).await;
        let extra = IceCandidate {
            candidate: "candidate:extra".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        alice_signaler
            .send_ice_candidate(&PeerId::from("bob"), extra)
            .await
            .unwrap();

        assert!(matches!(a_connected.recv().await, Some(ManagerEvent::Connected(_))));
        assert!(matches!(b_connected.recv().await, Some(ManagerEvent::Connected(_))));

        // two trickled each way plus the extra one, each applied once
        for _ in 0..100 {
            if network.candidates_applied() >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(network.candidates_applied(), 5);
    }

    #[tokio::test]
    async fn dropped_requests_are_rejected_and_later_offers_surface() {
        let (hub, network) = (LoopbackSignalHub::new(), LoopbackNetwork::new());
        let (a, b) = in_room(&hub, &network, ["alice", "bob"]).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        b.on(names::CONNECTION_REQUEST, move |event| {
            // ignore the first request, accept the rest
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return;
            }
            if let ManagerEvent::ConnectionRequest(request) = event {
                tokio::spawn(async move {
                    let _ = request.accept().await;
                });
            }
        });
        let mut failed = collect(&a, names::CONNECTION_FAILED);
        let mut connected = collect(&a, names::CONNECTED);

        a.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        assert!(matches!(
            failed.recv().await,
            Some(ManagerEvent::ConnectionFailed(peer)) if peer == PeerId::from("bob")
        ));

        a.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        assert!(matches!(connected.recv().await, Some(ManagerEvent::Connected(_))));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_fresh_offer_replaces_an_unanswered_request() {
        let (hub, network) = (LoopbackSignalHub::new(), LoopbackNetwork::new());
        let (a, b) = in_room(&hub, &network, ["alice", "bob"]).await;
        let mut requests = collect(&b, names::CONNECTION_REQUEST);

        a.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        let Some(ManagerEvent::ConnectionRequest(stale)) = requests.recv().await else {
            panic!("bob never saw the first request");
        };

        // alice restarts and offers again while bob sits on the first request
        a.close().await;
        let a = manager(&hub, &network, "alice");
        a.connect_to_room().await.unwrap();
        let mut connected = collect(&a, names::CONNECTED);
        a.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        let Some(ManagerEvent::ConnectionRequest(fresh)) = requests.recv().await else {
            panic!("bob never saw the second request");
        };

        assert!(matches!(stale.accept().await, Err(NegotiationError::Superseded(_))));
        drop(stale);
        fresh.accept().await.unwrap();
        assert!(matches!(connected.recv().await, Some(ManagerEvent::Connected(_))));
        assert_eq!(b.sessions().len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_fails_both_sides() {
        let (hub, network) = (LoopbackSignalHub::new(), LoopbackNetwork::new());
        network.refuse_links(true);
        let (a, b) = in_room(&hub, &network, ["alice", "bob"]).await;
        auto_accept(&b);
        let mut a_failed = collect(&a, names::CONNECTION_FAILED);
        let mut b_failed = collect(&b, names::CONNECTION_FAILED);
        let mut a_connected = collect(&a, names::CONNECTED);

        a.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        assert!(matches!(a_failed.recv().await, Some(ManagerEvent::ConnectionFailed(_))));
        assert!(matches!(b_failed.recv().await, Some(ManagerEvent::ConnectionFailed(_))));
        assert!(a_connected.try_recv().is_err());
    }

    #[tokio::test]
    async fn session_close_clears_bookkeeping_and_allows_reconnect() {
        let (hub, network) = (LoopbackSignalHub::new(), LoopbackNetwork::new());
        let (a, b) = in_room(&hub, &network, ["alice", "bob"]).await;
        auto_accept(&b);
        let mut a_connected = collect(&a, names::CONNECTED);
        let mut b_connected = collect(&b, names::CONNECTED);

        a.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        let Some(ManagerEvent::Connected(session)) = a_connected.recv().await else {
            panic!("alice never connected");
        };
        let Some(ManagerEvent::Connected(remote_session)) = b_connected.recv().await else {
            panic!("bob never connected");
        };

        let (tx, mut closed) = mpsc::unbounded_channel();
        for s in [&session, &remote_session] {
            let tx = tx.clone();
            s.on(names::CONNECTION_CLOSED, move |_| {
                let _ = tx.send(());
            });
        }
        session.close().await;
        closed.recv().await.unwrap();
        closed.recv().await.unwrap();
        assert!(a.session(&PeerId::from("bob")).is_none());
        assert!(b.session(&PeerId::from("alice")).is_none());

        a.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        assert!(matches!(a_connected.recv().await, Some(ManagerEvent::Connected(_))));
    }

    #[tokio::test]
    async fn close_shuts_everything_down() {
        let (hub, network) = (LoopbackSignalHub::new(), LoopbackNetwork::new());
        let (a, b) = in_room(&hub, &network, ["alice", "bob"]).await;
        auto_accept(&b);
        let mut a_connected = collect(&a, names::CONNECTED);
        a.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        let Some(ManagerEvent::Connected(session)) = a_connected.recv().await else {
            panic!("alice never connected");
        };

        a.close().await;
        a.close().await;
        assert!(session.is_closed());
        assert!(a.sessions().is_empty());
        assert!(matches!(a.get_room_peers().await, Err(NegotiationError::Closed)));
        assert!(b.get_room_peers().await.unwrap().is_empty());
    }
}
