//! Stream connection to a single peer
//!
//! Manages one TCP stream, including:
//! - Length-prefixed framing with partial-frame buffering
//! - Channel demultiplexing of inbound frames
//! - A writer queue so callers never wait on the socket
//!
//! A connection is configured (channels registered) before `start`, after
//! which it is driven by its own task and controlled through [`TcpHandle`].

use std::collections::HashSet;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::channel::{read_handler, ChannelTable, ConnectionId, Transport};
use super::{NetworkError, NetworkResult};
use crate::protocol::{peek_channel_id, peek_payload_len, ChannelId, Datagram, Marshal, DATAGRAM_HEADER_SIZE};

/// Outcome notifications of a running connection
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Socket-level failure; always followed by `Disconnected`
    Error(NetworkError),
    /// The connection is gone; no channel callback fires after this
    Disconnected,
}

/// Splits a byte stream into complete frames
///
/// A frame is returned whole, header included, once all of its payload has
/// arrived.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    max_frame_size: usize,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        length: usize,
    },
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_frame_size,
        }
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> NetworkResult<Option<Bytes>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    let Some(length) = peek_payload_len(buf) else {
                        return Ok(None);
                    };
                    if length > self.max_frame_size {
                        return Err(NetworkError::FrameTooLarge(length, self.max_frame_size));
                    }
                    buf.reserve(DATAGRAM_HEADER_SIZE + length);
                    self.state = DecodeState::Payload { length };
                }
                DecodeState::Payload { length } => {
                    if buf.len() < DATAGRAM_HEADER_SIZE + length {
                        return Ok(None);
                    }
                    self.state = DecodeState::Header;
                    return Ok(Some(buf.split_to(DATAGRAM_HEADER_SIZE + length).freeze()));
                }
            }
        }
    }
}

/// A stream connection that has not been started yet
pub struct TcpConnection {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    max_frame_size: usize,
    readers: ChannelTable<ChannelId>,
    writers: HashSet<ChannelId>,
    outbound: mpsc::UnboundedSender<Bytes>,
    outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    open: Arc<AtomicBool>,
}

impl TcpConnection {
    /// Wrap an accepted stream
    pub fn new(stream: TcpStream, max_frame_size: usize) -> NetworkResult<Self> {
        let peer_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        Ok(Self {
            id: ConnectionId::next(),
            stream,
            peer_addr,
            max_frame_size,
            readers: ChannelTable::new(),
            writers: HashSet::new(),
            outbound,
            outbound_rx,
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Open a stream to `addr`
    pub async fn connect(
        addr: SocketAddr,
        timeout: Duration,
        max_frame_size: usize,
    ) -> NetworkResult<Self> {
        tracing::debug!("Connecting to {}", addr);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout)??;
        tracing::info!("Connected to {}", addr);
        Self::new(stream, max_frame_size)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Route frames carrying `channel` to `on_message`
    pub fn register_read_channel<T, F>(&mut self, channel: ChannelId, on_message: F) -> NetworkResult<()>
    where
        T: Marshal + 'static,
        F: FnMut(T) + Send + 'static,
    {
        if self.readers.insert(channel, read_handler::<T, F>(channel, on_message)) {
            Ok(())
        } else {
            Err(self.duplicate(channel))
        }
    }

    /// Obtain a handle writing `T` frames on `channel`
    pub fn register_write_channel<T: Marshal>(&mut self, channel: ChannelId) -> NetworkResult<TcpWriteChannel<T>> {
        if !self.writers.insert(channel) {
            return Err(self.duplicate(channel));
        }
        Ok(TcpWriteChannel {
            channel,
            outbound: self.outbound.clone(),
            open: self.open.clone(),
            _message: PhantomData,
        })
    }

    fn duplicate(&self, channel: ChannelId) -> NetworkError {
        tracing::error!("Stream channel {} already registered on {}", channel, self.id);
        NetworkError::DuplicateChannel {
            transport: Transport::Reliable,
            host: Some(self.peer_addr.ip()),
            id: channel,
        }
    }

    /// Spawn the connection task
    ///
    /// `on_event` fires at most one `Error` and then exactly one
    /// `Disconnected`, unless the connection is closed locally through
    /// [`TcpHandle::disconnect`], in which case nothing fires.
    pub fn start<F>(self, on_event: F) -> TcpHandle
    where
        F: FnMut(ConnectionEvent) + Send + 'static,
    {
        let (shutdown, shutdown_rx) = mpsc::channel(1);
        let handle = TcpHandle {
            id: self.id,
            peer_addr: self.peer_addr,
            open: self.open.clone(),
            shutdown,
        };

        tokio::spawn(self.run(shutdown_rx, on_event));
        handle
    }

    async fn run<F>(self, mut shutdown_rx: mpsc::Receiver<()>, mut on_event: F)
    where
        F: FnMut(ConnectionEvent),
    {
        let TcpConnection {
            id,
            stream,
            peer_addr,
            max_frame_size,
            mut readers,
            mut outbound_rx,
            open,
            ..
        } = self;

        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = FrameDecoder::new(max_frame_size);
        let mut buf = BytesMut::with_capacity(4096);

        let outcome: NetworkResult<()> = 'io: loop {
            tokio::select! {
                // Explicit disconnect, or every handle dropped
                _ = shutdown_rx.recv() => {
                    open.store(false, Ordering::SeqCst);
                    // Frames queued before the close still go out
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if writer.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                    break Ok(());
                }
                read = reader.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => {
                            tracing::debug!("{} closed by {}", id, peer_addr);
                            break Ok(());
                        }
                        Ok(_) => loop {
                            match decoder.decode(&mut buf) {
                                Ok(Some(frame)) => {
                                    if !open.load(Ordering::SeqCst) {
                                        break 'io Ok(());
                                    }
                                    if let Some(channel) = peek_channel_id(&frame) {
                                        readers.dispatch(&channel, &frame);
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => break 'io Err(e),
                            }
                        },
                        Err(e) => break Err(e.into()),
                    }
                }
                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = writer.write_all(&frame).await {
                        break Err(e.into());
                    }
                }
            }
        };

        let closed_locally = !open.swap(false, Ordering::SeqCst);
        let _ = writer.shutdown().await;

        if closed_locally {
            tracing::debug!("{} to {} closed locally", id, peer_addr);
            return;
        }

        if let Err(e) = outcome {
            tracing::warn!("{} to {} failed: {}", id, peer_addr, e);
            on_event(ConnectionEvent::Error(e));
        }
        tracing::info!("{} to {} disconnected", id, peer_addr);
        on_event(ConnectionEvent::Disconnected);
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("readers", &self.readers)
            .field("writers", &self.writers)
            .finish()
    }
}

/// Control handle of a running connection
///
/// Dropping the last handle closes the connection like `disconnect`.
#[derive(Debug, Clone)]
pub struct TcpHandle {
    id: ConnectionId,
    peer_addr: SocketAddr,
    open: Arc<AtomicBool>,
    shutdown: mpsc::Sender<()>,
}

impl TcpHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the connection; later inbound frames and events are dropped
    pub fn disconnect(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown.try_send(());
        }
    }
}

/// Sending half of a stream channel
#[derive(Debug)]
pub struct TcpWriteChannel<T> {
    channel: ChannelId,
    outbound: mpsc::UnboundedSender<Bytes>,
    open: Arc<AtomicBool>,
    _message: PhantomData<fn(T)>,
}

impl<T> Clone for TcpWriteChannel<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel,
            outbound: self.outbound.clone(),
            open: self.open.clone(),
            _message: PhantomData,
        }
    }
}

impl<T: Marshal> TcpWriteChannel<T> {
    /// Queue a frame; fails once the connection is gone
    pub fn send(&self, message: T) -> NetworkResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(NetworkError::NotConnected);
        }
        self.outbound
            .send(Datagram::new(self.channel, message).encode())
            .map_err(|_| NetworkError::NotConnected)
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }
}
