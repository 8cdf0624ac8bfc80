//! In-process transport and signaler.
//!
//! `LoopbackNetwork` connects peer connections living in the same process.
//! Session descriptions are just `loopback <connection id>`; applying an
//! answer links the two connections, mirrors every channel the offerer
//! created onto the answerer, reports both sides connected, and opens the
//! channels on a later scheduler tick. Channels can be paused to build up a
//! buffered amount and resumed to drain it.
//!
//! `LoopbackSignalHub` routes signals between signalers joined to the same
//! named room.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;

use pairlink_core::config::IceServer;

use crate::session::SessionTransport;
use crate::signaler::{PeerId, SignalEvent, Signaler, SignalingError};
use crate::transport::{
    ChannelEvent, ChannelMessage, ChannelState, ConnectionEvent, ConnectionState, DataChannel, EventStream,
    IceCandidate, PeerConnection, SdpKind, SessionDescription, Subscribers, Transport, TransportError,
};

const SDP_PREFIX: &str = "loopback ";

/// Candidates trickled per local description.
const TRICKLED_CANDIDATES: u16 = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Network ──────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Weak<LoopbackConnection>>>,
    refuse_links: AtomicBool,
    candidates_applied: AtomicUsize,
}

/// One side of a pair made by [`LoopbackNetwork::connected_pair`].
pub struct LoopbackEnd {
    pub connection: Arc<dyn PeerConnection>,
    pub control: Arc<LoopbackChannel>,
    pub binary: Arc<LoopbackChannel>,
}

impl LoopbackEnd {
    pub fn session_transport(&self) -> SessionTransport {
        SessionTransport {
            connection: self.connection.clone(),
            control: self.control.clone(),
            binary: self.binary.clone(),
        }
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport { network: self.clone() }
    }

    /// While set, applying an answer fails both connections instead of
    /// linking them.
    pub fn refuse_links(&self, refuse: bool) {
        self.inner.refuse_links.store(refuse, Ordering::SeqCst);
    }

    /// Remote ICE candidates applied across every connection so far.
    pub fn candidates_applied(&self) -> usize {
        self.inner.candidates_applied.load(Ordering::SeqCst)
    }

    /// Two linked connections with open `control` and `binary` channels,
    /// skipping negotiation.
    pub async fn connected_pair(&self) -> Result<(LoopbackEnd, LoopbackEnd), TransportError> {
        let a = self.create();
        let b = self.create();
        let a_control = a.add_channel("control")?;
        let a_binary = a.add_channel("binary")?;
        *lock(&a.remote_id) = Some(b.id);
        *lock(&b.remote_id) = Some(a.id);

        let pairs = self
            .link(&a, &b, false)
            .ok_or_else(|| TransportError::Failed("links are refused".into()))?;
        let mut theirs = pairs.into_iter().map(|(_, theirs)| theirs);
        let (Some(b_control), Some(b_binary)) = (theirs.next(), theirs.next()) else {
            return Err(TransportError::Failed("channel mirroring failed".into()));
        };

        Ok((
            LoopbackEnd {
                connection: a,
                control: a_control,
                binary: a_binary,
            },
            LoopbackEnd {
                connection: b,
                control: b_control,
                binary: b_binary,
            },
        ))
    }

    fn create(&self) -> Arc<LoopbackConnection> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Arc::new_cyclic(|me| LoopbackConnection {
            id,
            me: me.clone(),
            network: self.clone(),
            state: Mutex::new(ConnectionState::New),
            remote_id: Mutex::new(None),
            remote: Mutex::new(Weak::new()),
            channels: Mutex::new(Vec::new()),
            events: Subscribers::new(),
        });
        let mut connections = lock(&self.inner.connections);
        connections.retain(|_, weak| weak.strong_count() > 0);
        connections.insert(id, Arc::downgrade(&connection));
        connection
    }

    fn lookup(&self, id: u64) -> Option<Arc<LoopbackConnection>> {
        lock(&self.inner.connections).get(&id).and_then(Weak::upgrade)
    }

    /// Connect `offerer` to `answerer`. Returns the mirrored channel pairs,
    /// or `None` when links are refused.
    fn link(
        &self,
        offerer: &Arc<LoopbackConnection>,
        answerer: &Arc<LoopbackConnection>,
        defer_open: bool,
    ) -> Option<Vec<(Arc<LoopbackChannel>, Arc<LoopbackChannel>)>> {
        if self.inner.refuse_links.load(Ordering::SeqCst) {
            tracing::debug!(offerer = offerer.id, answerer = answerer.id, "refusing loopback link");
            offerer.set_state(ConnectionState::Failed);
            answerer.set_state(ConnectionState::Failed);
            return None;
        }

        *lock(&offerer.remote) = Arc::downgrade(answerer);
        *lock(&answerer.remote) = Arc::downgrade(offerer);

        let ours: Vec<Arc<LoopbackChannel>> = lock(&offerer.channels).clone();
        let pairs: Vec<_> = ours
            .into_iter()
            .map(|channel| {
                let mirrored = answerer.accept_channel(&channel);
                (channel, mirrored)
            })
            .collect();

        offerer.set_state(ConnectionState::Connected);
        answerer.set_state(ConnectionState::Connected);
        tracing::debug!(offerer = offerer.id, answerer = answerer.id, channels = pairs.len(), "loopback linked");

        if defer_open {
            let pending = pairs.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                for (ours, theirs) in pending {
                    ours.open();
                    theirs.open();
                }
            });
        } else {
            for (ours, theirs) in &pairs {
                ours.open();
                theirs.open();
            }
        }
        Some(pairs)
    }
}

pub struct LoopbackTransport {
    network: LoopbackNetwork,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn create_connection(&self, ice_servers: &[IceServer]) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let connection = self.network.create();
        tracing::trace!(connection = connection.id, ice_servers = ice_servers.len(), "loopback connection created");
        let connection: Arc<dyn PeerConnection> = connection;
        Ok(connection)
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

pub struct LoopbackConnection {
    id: u64,
    me: Weak<LoopbackConnection>,
    network: LoopbackNetwork,
    state: Mutex<ConnectionState>,
    /// Connection id named by the remote description.
    remote_id: Mutex<Option<u64>>,
    remote: Mutex<Weak<LoopbackConnection>>,
    channels: Mutex<Vec<Arc<LoopbackChannel>>>,
    events: Subscribers<ConnectionEvent>,
}

impl LoopbackConnection {
    fn add_channel(&self, label: &str) -> Result<Arc<LoopbackChannel>, TransportError> {
        if self.state().is_terminal() {
            return Err(TransportError::ConnectionClosed);
        }
        let channel = LoopbackChannel::new(label);
        lock(&self.channels).push(channel.clone());

        // Created after linking: mirror it right away.
        let remote = lock(&self.remote).upgrade();
        if let (Some(remote), ConnectionState::Connected) = (remote, self.state()) {
            let mirrored = remote.accept_channel(&channel);
            channel.open();
            mirrored.open();
        }
        Ok(channel)
    }

    /// Create the local end of a channel the remote side opened.
    fn accept_channel(&self, remote: &Arc<LoopbackChannel>) -> Arc<LoopbackChannel> {
        let channel = LoopbackChannel::new(&remote.label);
        LoopbackChannel::pair(remote, &channel);
        lock(&self.channels).push(channel.clone());
        self.events.publish(ConnectionEvent::DataChannel(channel.clone()));
        channel
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = lock(&self.state);
            if *state == next || state.is_terminal() {
                return;
            }
            *state = next;
        }
        self.events.publish(ConnectionEvent::StateChanged(next));
    }

    fn description(&self, kind: SdpKind) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("{SDP_PREFIX}{}", self.id),
        }
    }

    /// Publish this side's candidates on a later tick.
    fn trickle(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            for n in 0..TRICKLED_CANDIDATES {
                tokio::task::yield_now().await;
                if me.state().is_terminal() {
                    return;
                }
                me.events.publish(ConnectionEvent::IceCandidate(IceCandidate {
                    candidate: format!("candidate:{n} 1 udp 2122260223 127.0.0.1 {} typ host", 40000 + me.id),
                    sdp_mid: Some("0".into()),
                    sdp_m_line_index: Some(0),
                }));
            }
        });
    }

    fn shutdown(&self) {
        {
            let state = lock(&self.state);
            if *state == ConnectionState::Closed {
                return;
            }
        }
        let channels = std::mem::take(&mut *lock(&self.channels));
        for channel in channels {
            channel.shutdown();
        }
        // Terminal states block further transitions; force Closed.
        *lock(&self.state) = ConnectionState::Closed;
        self.events.publish(ConnectionEvent::StateChanged(ConnectionState::Closed));

        let remote = std::mem::take(&mut *lock(&self.remote)).upgrade();
        if let Some(remote) = remote {
            remote.shutdown();
        }
        tracing::trace!(connection = self.id, "loopback connection closed");
    }
}

fn parse_description(description: &SessionDescription) -> Result<u64, TransportError> {
    description
        .sdp
        .strip_prefix(SDP_PREFIX)
        .and_then(|id| id.trim().parse().ok())
        .ok_or_else(|| TransportError::InvalidDescription(description.sdp.clone()))
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel: Arc<dyn DataChannel> = self.add_channel(label)?;
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.state().is_terminal() {
            return Err(TransportError::ConnectionClosed);
        }
        self.trickle();
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.state().is_terminal() {
            return Err(TransportError::ConnectionClosed);
        }
        if lock(&self.remote_id).is_none() {
            return Err(TransportError::NoRemoteDescription);
        }
        self.trickle();
        Ok(self.description(SdpKind::Answer))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        if self.state().is_terminal() {
            return Err(TransportError::ConnectionClosed);
        }
        let remote_id = parse_description(&description)?;
        let remote = self
            .network
            .lookup(remote_id)
            .ok_or_else(|| TransportError::InvalidDescription(description.sdp.clone()))?;
        *lock(&self.remote_id) = Some(remote_id);
        self.set_state(ConnectionState::Connecting);

        if description.kind == SdpKind::Answer {
            let me = self.me.upgrade().ok_or(TransportError::ConnectionClosed)?;
            self.network.link(&me, &remote, true);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.state().is_terminal() {
            return Err(TransportError::ConnectionClosed);
        }
        tracing::trace!(connection = self.id, candidate = %candidate.candidate, "remote candidate applied");
        self.network.inner.candidates_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn events(&self) -> EventStream<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.shutdown();
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

pub struct LoopbackChannel {
    label: String,
    state: Mutex<ChannelState>,
    peer: Mutex<Weak<LoopbackChannel>>,
    paused: AtomicBool,
    /// Messages held back while paused.
    outbox: Mutex<VecDeque<ChannelMessage>>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    inbox: Mutex<Inbox>,
    events: Subscribers<ChannelEvent>,
}

#[derive(Default)]
struct Inbox {
    /// Messages received while nobody reads.
    held: Vec<ChannelMessage>,
    reader: Option<mpsc::UnboundedSender<ChannelMessage>>,
    closed: bool,
}

impl LoopbackChannel {
    fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            peer: Mutex::new(Weak::new()),
            paused: AtomicBool::new(false),
            outbox: Mutex::new(VecDeque::new()),
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            inbox: Mutex::new(Inbox::default()),
            events: Subscribers::new(),
        })
    }

    fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        *lock(&a.peer) = Arc::downgrade(b);
        *lock(&b.peer) = Arc::downgrade(a);
    }

    /// Hold outgoing messages locally so the buffered amount grows.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Deliver everything held back and report the drain.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let held: Vec<ChannelMessage> = lock(&self.outbox).drain(..).collect();
        for message in held {
            self.forward(message);
        }
        let before = self.buffered.swap(0, Ordering::SeqCst);
        if before > self.low_threshold.load(Ordering::SeqCst) {
            self.events.publish(ChannelEvent::BufferedAmountLow);
        }
    }

    fn open(&self) {
        {
            let mut state = lock(&self.state);
            if *state != ChannelState::Connecting {
                return;
            }
            *state = ChannelState::Open;
        }
        self.events.publish(ChannelEvent::Open);
    }

    fn forward(&self, message: ChannelMessage) {
        if let Some(peer) = lock(&self.peer).upgrade() {
            peer.deliver(message);
        }
    }

    fn deliver(&self, message: ChannelMessage) {
        let mut inbox = lock(&self.inbox);
        if inbox.closed {
            return;
        }
        let message = match &inbox.reader {
            Some(tx) => match tx.unbounded_send(message) {
                Ok(()) => return,
                Err(e) => e.into_inner(),
            },
            None => message,
        };
        // reader gone or not yet attached
        inbox.reader = None;
        inbox.held.push(message);
    }

    fn shutdown(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        lock(&self.outbox).clear();
        self.buffered.store(0, Ordering::SeqCst);
        {
            let mut inbox = lock(&self.inbox);
            inbox.closed = true;
            inbox.reader = None;
        }
        self.events.publish(ChannelEvent::Closed);

        let peer = std::mem::take(&mut *lock(&self.peer)).upgrade();
        if let Some(peer) = peer {
            peer.shutdown();
        }
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
    }

    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::ChannelNotOpen(self.label.clone()));
        }
        if self.paused.load(Ordering::SeqCst) {
            self.buffered.fetch_add(message.len(), Ordering::SeqCst);
            lock(&self.outbox).push_back(message);
            return Ok(());
        }
        self.forward(message);
        Ok(())
    }

    fn events(&self) -> EventStream<ChannelEvent> {
        self.events.subscribe()
    }

    fn messages(&self) -> EventStream<ChannelMessage> {
        let (tx, rx) = mpsc::unbounded();
        let mut inbox = lock(&self.inbox);
        for message in inbox.held.drain(..) {
            let _ = tx.unbounded_send(message);
        }
        if !inbox.closed {
            inbox.reader = Some(tx);
        }
        rx.boxed()
    }

    async fn close(&self) {
        self.shutdown();
    }
}

// ── Signaling ────────────────────────────────────────────────────────────────

type Room = HashMap<PeerId, Arc<Subscribers<SignalEvent>>>;

#[derive(Clone, Default)]
pub struct LoopbackSignalHub {
    rooms: Arc<Mutex<HashMap<String, Room>>>,
}

impl LoopbackSignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signaler with a random identity.
    pub fn signaler(&self) -> LoopbackSignaler {
        self.signaler_with_id(PeerId::random())
    }

    pub fn signaler_with_id(&self, id: PeerId) -> LoopbackSignaler {
        LoopbackSignaler {
            hub: self.clone(),
            id,
            room: Mutex::new(None),
            inbox: Arc::new(Subscribers::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn join(&self, room: &str, id: &PeerId, inbox: Arc<Subscribers<SignalEvent>>) {
        lock(&self.rooms)
            .entry(room.to_string())
            .or_default()
            .insert(id.clone(), inbox);
    }

    fn leave(&self, room: &str, id: &PeerId) {
        let mut rooms = lock(&self.rooms);
        if let Some(members) = rooms.get_mut(room) {
            members.remove(id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    fn members(&self, room: &str) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = lock(&self.rooms)
            .get(room)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    fn deliver(&self, room: &str, to: &PeerId, event: SignalEvent) -> Result<(), SignalingError> {
        let inbox = lock(&self.rooms)
            .get(room)
            .and_then(|members| members.get(to))
            .cloned()
            .ok_or_else(|| SignalingError::UnknownPeer(to.clone()))?;
        inbox.publish(event);
        Ok(())
    }
}

pub struct LoopbackSignaler {
    hub: LoopbackSignalHub,
    id: PeerId,
    room: Mutex<Option<String>>,
    inbox: Arc<Subscribers<SignalEvent>>,
    closed: AtomicBool,
}

impl LoopbackSignaler {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    fn room(&self) -> Result<String, SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        lock(&self.room).clone().ok_or(SignalingError::NotInRoom)
    }

    fn send(&self, to: &PeerId, event: SignalEvent) -> Result<(), SignalingError> {
        let room = self.room()?;
        self.hub.deliver(&room, to, event)
    }
}

#[async_trait]
impl Signaler for LoopbackSignaler {
    async fn connect_to_room(&self, room: &str) -> Result<PeerId, SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        {
            let mut current = lock(&self.room);
            if let Some(existing) = current.as_ref() {
                return Err(SignalingError::AlreadyInRoom(existing.clone()));
            }
            *current = Some(room.to_string());
        }
        self.hub.join(room, &self.id, self.inbox.clone());
        tracing::debug!(room, peer = %self.id, "joined loopback room");
        Ok(self.id.clone())
    }

    async fn send_offer(&self, to: &PeerId, offer: SessionDescription) -> Result<(), SignalingError> {
        self.send(to, SignalEvent::Offer { from: self.id.clone(), offer })
    }

    async fn send_answer(&self, to: &PeerId, answer: SessionDescription) -> Result<(), SignalingError> {
        self.send(to, SignalEvent::Answer { from: self.id.clone(), answer })
    }

    async fn send_ice_candidate(&self, to: &PeerId, candidate: IceCandidate) -> Result<(), SignalingError> {
        self.send(to, SignalEvent::IceCandidate { from: self.id.clone(), candidate })
    }

    async fn reject_offer(&self, to: &PeerId) -> Result<(), SignalingError> {
        self.send(to, SignalEvent::ConnectionRejected { from: self.id.clone() })
    }

    async fn get_room_peers(&self) -> Result<Vec<PeerId>, SignalingError> {
        let room = self.room()?;
        Ok(self
            .hub
            .members(&room)
            .into_iter()
            .filter(|peer| *peer != self.id)
            .collect())
    }

    fn subscribe(&self) -> EventStream<SignalEvent> {
        self.inbox.subscribe()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(room) = lock(&self.room).take() {
            self.hub.leave(&room, &self.id);
        }
        self.inbox.close();
    }
}
