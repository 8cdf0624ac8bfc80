//! Peer session — typed events and binary transfers over one negotiated
//! connection.
//!
//! A session owns two open channels: `control` carries JSON
//! `{event, args}` envelopes, `binary` carries chunker frames. One reader
//! task per channel dispatches inbound messages in arrival order; handlers
//! run synchronously on that task.
//!
//! Closing is a two-phase handshake: a goodbye on the control channel, then
//! both channels and the connection are closed. `connectionClosed` fires
//! exactly once whichever side starts it, including when the remote side
//! simply disappears.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::io::AsyncReadExt;

use pairlink_core::chunker::{BinaryChunker, ChunkError, Received, TimeoutReceiver, TransferStream};
use pairlink_core::config::{PairlinkConfig, SessionConfig};
use pairlink_core::wire::{ControlMessage, FileMetadata, TransferId, CLOSE_EVENT};

use crate::backpressure::wait_for_drain;
use crate::events::{names, ListenerId, Listeners};
use crate::scope::Scope;
use crate::signaler::PeerId;
use crate::transport::{
    ChannelMessage, ChannelState, ConnectionEvent, DataChannel, PeerConnection, TransportError,
};

/// Read size when streaming a file from disk.
const FILE_READ_CHUNK: usize = 64 * 1024;

/// Invoked once when the session has fully closed.
pub type CloseCallback = Box<dyn FnOnce(&PeerId) + Send>;

/// Payload handed to session listeners.
#[derive(Debug)]
pub enum SessionEvent {
    /// A completed non-file transfer.
    Data { metadata: Option<Value>, data: Bytes },
    /// A completed file transfer.
    File(ReceivedFile),
    /// A file transfer delivered incrementally.
    FileStream { metadata: FileMetadata, stream: TransferStream },
    ConnectionClosed,
    DataTimedOut(TransferId),
    Error(Arc<SessionError>),
    /// An application event emitted by the remote side.
    Custom { event: String, args: Vec<Value> },
}

/// The negotiated connection and its two open channels.
#[derive(Clone)]
pub struct SessionTransport {
    pub connection: Arc<dyn PeerConnection>,
    pub control: Arc<dyn DataChannel>,
    pub binary: Arc<dyn DataChannel>,
}

#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    remote_id: PeerId,
    transport: SessionTransport,
    chunker: BinaryChunker,
    listeners: Listeners<SessionEvent>,
    config: SessionConfig,
    closed: AtomicBool,
    on_close: Mutex<Option<CloseCallback>>,
    tasks: Scope,
}

impl PeerSession {
    /// Wrap an established connection. Both channels must already be open.
    ///
    /// Spawns the channel readers, so this must be called inside a Tokio
    /// runtime.
    pub fn new(
        remote_id: PeerId,
        transport: SessionTransport,
        config: &PairlinkConfig,
        on_close: Option<CloseCallback>,
    ) -> Result<Self, SessionError> {
        let (chunker, timeouts) = BinaryChunker::new(&config.chunker)?;
        let inner = Arc::new(SessionInner {
            remote_id,
            transport,
            chunker,
            listeners: Listeners::new(),
            config: config.session.clone(),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(on_close),
            tasks: Scope::new(),
        });

        inner.tasks.spawn(read_control(inner.clone()));
        inner.tasks.spawn(read_binary(inner.clone()));
        inner.tasks.spawn(forward_timeouts(inner.clone(), timeouts));
        inner.tasks.spawn(watch_connection(inner.clone()));

        tracing::info!(peer = %inner.remote_id, "session established");
        Ok(Self { inner })
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.inner.remote_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn on<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.on(event, handler)
    }

    pub fn once<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.once(event, handler)
    }

    /// Remove a listener. Removing one that is not registered is a no-op.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.listeners.off(event, id)
    }

    /// Send an application event to the remote side.
    ///
    /// Names used for locally produced events and the close handshake are
    /// rejected.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), SessionError> {
        if event == CLOSE_EVENT || names::is_session_reserved(event) {
            return Err(SessionError::ReservedEvent(event.to_string()));
        }
        let text = serde_json::to_string(&ControlMessage::new(event, args)).map_err(SessionError::Encode)?;
        self.inner
            .send_on(&self.inner.transport.control, ChannelMessage::Text(text))
            .await
    }

    /// Send a buffer, optionally tagged with JSON metadata. Resolves once
    /// every frame has been handed to the binary channel.
    pub async fn send_raw(&self, data: impl Into<Bytes>, metadata: Option<&Value>) -> Result<TransferId, SessionError> {
        let frames = self.inner.chunker.chunk(data.into(), metadata)?;
        let transfer_id = frames.transfer_id();
        for frame in frames {
            self.inner.send_frame(frame).await?;
        }
        tracing::debug!(peer = %self.inner.remote_id, transfer_id = %transfer_id, "transfer sent");
        Ok(transfer_id)
    }

    pub async fn send_file(&self, file: &OutgoingFile) -> Result<TransferId, SessionError> {
        self.send_raw(file.data.clone(), Some(&file.metadata.to_value())).await
    }

    /// Send bytes from a live producer. An upstream error aborts the
    /// transfer; the remote side discards it on timeout.
    pub async fn send_stream<S, E>(&self, source: S, metadata: Option<&Value>) -> Result<TransferId, SessionError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: fmt::Display,
    {
        let mut frames = self.inner.chunker.stream(source, metadata)?;
        let transfer_id = frames.transfer_id();
        while let Some(frame) = frames.next().await {
            let frame = frame.map_err(|e| SessionError::Source(e.to_string()))?;
            self.inner.send_frame(frame).await?;
        }
        tracing::debug!(peer = %self.inner.remote_id, transfer_id = %transfer_id, "stream transfer sent");
        Ok(transfer_id)
    }

    /// Stream a file from disk as a file transfer without loading it whole.
    pub async fn send_file_path(&self, path: impl AsRef<Path>) -> Result<TransferId, SessionError> {
        let path = path.as_ref();
        let metadata = describe_path(path).await?;
        let file = tokio::fs::File::open(path).await?;
        let source = futures::stream::try_unfold(file, |mut file| async move {
            let mut buf = BytesMut::with_capacity(FILE_READ_CHUNK);
            let n = file.read_buf(&mut buf).await?;
            Ok::<_, io::Error>((n > 0).then(|| (buf.freeze(), file)))
        });
        self.send_stream(Box::pin(source), Some(&metadata.to_value())).await
    }

    /// Close the session: goodbye, then channels and connection.
    /// Closing an already closed session is a no-op.
    pub async fn close(&self) {
        self.inner.shutdown(true).await;
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("remote_id", &self.inner.remote_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionInner {
    async fn send_frame(&self, frame: Bytes) -> Result<(), SessionError> {
        self.send_on(&self.transport.binary, ChannelMessage::Binary(frame)).await
    }

    async fn send_on(&self, channel: &Arc<dyn DataChannel>, message: ChannelMessage) -> Result<(), SessionError> {
        if channel.state() != ChannelState::Open {
            return Err(SessionError::ChannelNotOpen(channel.label().to_string()));
        }
        wait_for_drain(channel.as_ref(), self.config.low_water_mark, self.config.drain_timeout()).await?;
        channel.send(message).await?;
        Ok(())
    }

    fn handle_control(self: &Arc<Self>, text: &str) {
        let message: ControlMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                self.report(SessionError::MalformedControl(e));
                return;
            }
        };

        if message.is_goodbye() {
            tracing::debug!(peer = %self.remote_id, "peer sent goodbye");
            self.remote_gone();
            return;
        }
        if names::is_session_reserved(&message.event) {
            self.report(SessionError::Protocol(format!(
                "peer emitted reserved event {:?}",
                message.event
            )));
            return;
        }

        let ControlMessage { event, args } = message;
        self.listeners.emit_with(&event, || SessionEvent::Custom {
            event: event.clone(),
            args: args.clone(),
        });
    }

    fn handle_frame(&self, frame: Bytes) {
        let received = match self.chunker.receive_chunk(frame) {
            Ok(received) => received,
            Err(e) => {
                self.report(e.into());
                return;
            }
        };
        if received.is_stream {
            return;
        }

        let Received {
            transfer_id,
            data,
            metadata,
            ..
        } = received;
        let file = metadata.as_ref().and_then(FileMetadata::from_value);

        match (file, data) {
            (Some(file), data) if self.listeners.count(names::FILE_STREAM) > 0 => {
                let stream = match data {
                    Some(data) => TransferStream::from_bytes(transfer_id, data),
                    None => match self.chunker.set_data_is_stream(transfer_id) {
                        Ok(stream) => stream,
                        Err(e) => {
                            self.report(e.into());
                            return;
                        }
                    },
                };
                self.deliver_stream(file, stream);
            }
            (Some(file), Some(data)) => {
                tracing::info!(
                    peer = %self.remote_id,
                    transfer_id = %transfer_id,
                    name = %file.name,
                    bytes = data.len(),
                    "file received"
                );
                let received = ReceivedFile { metadata: file, data };
                self.listeners
                    .emit_with(names::FILE, || SessionEvent::File(received.clone()));
            }
            (None, Some(data)) => {
                self.listeners.emit_with(names::DATA, || SessionEvent::Data {
                    metadata: metadata.clone(),
                    data: data.clone(),
                });
            }
            (_, None) => {}
        }
    }

    /// Hand one stream to every current streaming listener.
    fn deliver_stream(&self, metadata: FileMetadata, stream: TransferStream) {
        let handlers = self.listeners.take_handlers(names::FILE_STREAM);
        tracing::debug!(
            peer = %self.remote_id,
            transfer_id = %stream.id(),
            readers = handlers.len(),
            "delivering file stream"
        );
        let streams = stream.tee(handlers.len());
        for (handler, stream) in handlers.into_iter().zip(streams) {
            handler(SessionEvent::FileStream {
                metadata: metadata.clone(),
                stream,
            });
        }
    }

    fn report(&self, error: SessionError) {
        tracing::warn!(peer = %self.remote_id, error = %error, "session error");
        let error = Arc::new(error);
        self.listeners
            .emit_with(names::ERROR, || SessionEvent::Error(error.clone()));
    }

    /// The remote side left. Runs close processing off the calling reader
    /// task, which the close itself tears down.
    fn remote_gone(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move { inner.shutdown(false).await });
    }

    async fn shutdown(&self, say_goodbye: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let SessionTransport {
            connection,
            control,
            binary,
        } = &self.transport;

        if say_goodbye && control.state() == ChannelState::Open {
            match serde_json::to_string(&ControlMessage::goodbye()) {
                Ok(text) => {
                    if let Err(e) = control.send(ChannelMessage::Text(text)).await {
                        tracing::warn!(peer = %self.remote_id, error = %e, "failed to send goodbye");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode goodbye"),
            }
        }

        control.close().await;
        binary.close().await;
        connection.close().await;
        self.chunker.clear();

        tracing::info!(peer = %self.remote_id, initiated_locally = say_goodbye, "session closed");
        self.listeners
            .emit_with(names::CONNECTION_CLOSED, || SessionEvent::ConnectionClosed);

        let callback = self
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(&self.remote_id);
        }

        self.listeners.clear();
        self.tasks.cancel();
    }
}

// ── Background tasks ─────────────────────────────────────────────────────────

async fn read_control(inner: Arc<SessionInner>) {
    let mut messages = inner.transport.control.messages();
    while let Some(message) = messages.next().await {
        match message {
            ChannelMessage::Text(text) => inner.handle_control(&text),
            ChannelMessage::Binary(bytes) => inner.report(SessionError::UnexpectedMessage {
                channel: "control",
                len: bytes.len(),
            }),
        }
    }
    tracing::debug!(peer = %inner.remote_id, "control channel ended");
    inner.remote_gone();
}

async fn read_binary(inner: Arc<SessionInner>) {
    let mut messages = inner.transport.binary.messages();
    while let Some(message) = messages.next().await {
        match message {
            ChannelMessage::Binary(frame) => inner.handle_frame(frame),
            ChannelMessage::Text(text) => inner.report(SessionError::UnexpectedMessage {
                channel: "binary",
                len: text.len(),
            }),
        }
    }
    tracing::debug!(peer = %inner.remote_id, "binary channel ended");
    inner.remote_gone();
}

async fn forward_timeouts(inner: Arc<SessionInner>, mut timeouts: TimeoutReceiver) {
    while let Some(transfer_id) = timeouts.recv().await {
        inner
            .listeners
            .emit_with(names::DATA_TIMED_OUT, || SessionEvent::DataTimedOut(transfer_id));
    }
}

async fn watch_connection(inner: Arc<SessionInner>) {
    let mut events = inner.transport.connection.events();
    if inner.transport.connection.state().is_terminal() {
        inner.remote_gone();
        return;
    }
    while let Some(event) = events.next().await {
        if let ConnectionEvent::StateChanged(state) = event {
            if state.is_terminal() {
                tracing::debug!(peer = %inner.remote_id, ?state, "connection ended");
                inner.remote_gone();
                return;
            }
        }
    }
}

// ── Files ────────────────────────────────────────────────────────────────────

/// A file to send: reserved file metadata plus its bytes.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

impl OutgoingFile {
    /// An in-memory file, last modified now.
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let metadata = FileMetadata::new(name, mime_type, data.len() as u64, millis_since_epoch(SystemTime::now()));
        Self { metadata, data }
    }

    /// Read a file from disk. The MIME type is guessed from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = describe_path(path).await?;
        let data = tokio::fs::read(path).await?;
        Ok(Self {
            metadata,
            data: Bytes::from(data),
        })
    }
}

/// A completed inbound file transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

impl ReceivedFile {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Write the file into `dir` under its final path component and return
    /// the written path.
    pub async fn write_to(&self, dir: impl AsRef<Path>) -> io::Result<PathBuf> {
        let name = Path::new(&self.metadata.name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("received"));
        let path = dir.as_ref().join(name);
        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}

async fn describe_path(path: &Path) -> io::Result<FileMetadata> {
    let stat = tokio::fs::metadata(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let last_modified = stat.modified().map(millis_since_epoch).unwrap_or(0);
    Ok(FileMetadata::new(name, mime.essence_str(), stat.len(), last_modified))
}

fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("channel {0} is not open")]
    ChannelNotOpen(String),

    #[error("channel {channel} did not drain within {waited:?}")]
    BackpressureTimeout { channel: String, waited: Duration },

    #[error("event name {0:?} is reserved")]
    ReservedEvent(String),

    #[error("failed to encode control message: {0}")]
    Encode(serde_json::Error),

    #[error("malformed control message: {0}")]
    MalformedControl(serde_json::Error),

    #[error("unexpected {len}-byte message type on the {channel} channel")]
    UnexpectedMessage { channel: &'static str, len: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transfer source failed: {0}")]
    Source(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
