//! Shared datagram socket
//!
//! One socket serves every peer. Inbound datagrams are routed by the pair
//! (source host, channel id); only the channel id header is peeked before
//! the routing decision. The routing table is owned by the socket's task
//! and is only ever changed by commands sent to that task.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use super::channel::{read_handler, ChannelTable, InboundHandler, Transport};
use super::{NetworkError, NetworkResult};
use crate::protocol::{peek_channel_id, ChannelId, Datagram, Marshal};

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

type ReadKey = (IpAddr, ChannelId);
type WriteKey = (SocketAddr, ChannelId);

enum UdpCommand {
    RegisterRead {
        key: ReadKey,
        handler: InboundHandler,
        /// Told whether the channel was added
        reply: Box<dyn FnOnce(bool) + Send>,
    },
    DeregisterRead {
        key: ReadKey,
    },
    RegisterWrite {
        key: WriteKey,
        open: Arc<AtomicBool>,
        reply: oneshot::Sender<bool>,
    },
    DeregisterWrite {
        key: WriteKey,
    },
    DeregisterHost {
        host: IpAddr,
    },
    Shutdown,
}

/// Datagram socket multiplexing channels for many peers
#[derive(Debug)]
pub struct UdpMultiplexer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    remote: Option<SocketAddr>,
    commands: mpsc::UnboundedSender<UdpCommand>,
}

impl UdpMultiplexer {
    /// Bind `port` on `bind` (0 for an OS-assigned port) and start receiving
    /// from any host
    pub async fn listen(bind: IpAddr, port: u16) -> NetworkResult<Self> {
        let addr = SocketAddr::new(bind, port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind { addr, source })?;
        Self::start(socket, None)
    }

    /// Bind an ephemeral port and fix the remote peer
    pub async fn connect(bind: IpAddr, remote: SocketAddr) -> NetworkResult<Self> {
        let addr = SocketAddr::new(bind, 0);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind { addr, source })?;
        socket.connect(remote).await?;
        Self::start(socket, Some(remote))
    }

    fn start(socket: UdpSocket, remote: Option<SocketAddr>) -> NetworkResult<Self> {
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let (commands, receiver) = mpsc::unbounded_channel();

        match remote {
            Some(remote) => tracing::info!("Datagram socket {} connected to {}", local_addr, remote),
            None => tracing::info!("Datagram socket listening on {}", local_addr),
        }

        let task = UdpTask {
            socket: socket.clone(),
            readers: ChannelTable::new(),
            writers: HashMap::new(),
            commands: receiver,
        };
        tokio::spawn(task.run());

        Ok(Self {
            socket,
            local_addr,
            remote,
            commands,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Fixed remote peer in connected mode
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Route datagrams carrying `channel` from `host` to `on_message`
    pub async fn register_read_channel<T, F>(
        &self,
        channel: ChannelId,
        host: IpAddr,
        on_message: F,
    ) -> NetworkResult<()>
    where
        T: Marshal + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.submit_read_channel(channel, host, on_message, move |result| {
            let _ = reply.send(result);
        })?;
        response.await.map_err(|_| NetworkError::ChannelClosed)?
    }

    /// Enqueue a read channel registration without waiting for the socket task
    ///
    /// `on_registered` runs on the socket task once the routing table has
    /// been updated. Only a closed socket is reported here.
    pub fn submit_read_channel<T, F, R>(
        &self,
        channel: ChannelId,
        host: IpAddr,
        on_message: F,
        on_registered: R,
    ) -> NetworkResult<()>
    where
        T: Marshal + 'static,
        F: FnMut(T) + Send + 'static,
        R: FnOnce(NetworkResult<()>) + Send + 'static,
    {
        self.command(UdpCommand::RegisterRead {
            key: (host, channel),
            handler: read_handler::<T, F>(channel, on_message),
            reply: Box::new(move |added| {
                if added {
                    on_registered(Ok(()));
                } else {
                    tracing::error!("Datagram read channel {} already registered for {}", channel, host);
                    on_registered(Err(NetworkError::DuplicateChannel {
                        transport: Transport::Unreliable,
                        host: Some(host),
                        id: channel,
                    }));
                }
            }),
        })
    }

    /// Obtain a handle sending `T` on `channel` to `target`
    pub async fn register_write_channel<T: Marshal>(
        &self,
        channel: ChannelId,
        target: SocketAddr,
    ) -> NetworkResult<UdpWriteChannel<T>> {
        let open = Arc::new(AtomicBool::new(true));
        let (reply, response) = oneshot::channel();
        self.command(UdpCommand::RegisterWrite {
            key: (target, channel),
            open: open.clone(),
            reply,
        })?;

        if response.await.map_err(|_| NetworkError::ChannelClosed)? {
            Ok(UdpWriteChannel {
                channel,
                target,
                socket: self.socket.clone(),
                open,
                _message: PhantomData,
            })
        } else {
            tracing::error!("Datagram write channel {} already registered for {}", channel, target);
            Err(NetworkError::DuplicateChannel {
                transport: Transport::Unreliable,
                host: Some(target.ip()),
                id: channel,
            })
        }
    }

    pub fn deregister_read_channel(&self, channel: ChannelId, host: IpAddr) {
        let _ = self.command(UdpCommand::DeregisterRead {
            key: (host, channel),
        });
    }

    pub fn deregister_write_channel(&self, channel: ChannelId, target: SocketAddr) {
        let _ = self.command(UdpCommand::DeregisterWrite {
            key: (target, channel),
        });
    }

    /// Drop every read and write channel belonging to `host`
    pub fn deregister_host(&self, host: IpAddr) {
        let _ = self.command(UdpCommand::DeregisterHost { host });
    }

    /// Stop receiving and close all write channels
    pub fn close(&self) {
        let _ = self.command(UdpCommand::Shutdown);
    }

    fn command(&self, command: UdpCommand) -> NetworkResult<()> {
        self.commands
            .send(command)
            .map_err(|_| NetworkError::ChannelClosed)
    }
}

impl Drop for UdpMultiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sending half of a datagram channel
///
/// Sends are best effort: a full socket buffer drops the datagram.
#[derive(Debug)]
pub struct UdpWriteChannel<T> {
    channel: ChannelId,
    target: SocketAddr,
    socket: Arc<UdpSocket>,
    open: Arc<AtomicBool>,
    _message: PhantomData<fn(T)>,
}

impl<T> Clone for UdpWriteChannel<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel,
            target: self.target,
            socket: self.socket.clone(),
            open: self.open.clone(),
            _message: PhantomData,
        }
    }
}

impl<T: Marshal> UdpWriteChannel<T> {
    pub fn send(&self, message: T) -> NetworkResult<()> {
        if !self.is_open() {
            return Err(NetworkError::ChannelClosed);
        }

        let bytes = Datagram::new(self.channel, message).encode();
        match self.socket.try_send_to(&bytes, self.target) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::trace!("Dropping datagram on channel {}, socket busy", self.channel);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct UdpTask {
    socket: Arc<UdpSocket>,
    readers: ChannelTable<ReadKey>,
    writers: HashMap<WriteKey, Arc<AtomicBool>>,
    commands: mpsc::UnboundedReceiver<UdpCommand>,
}

impl UdpTask {
    async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            // Queued registrations apply before the next datagram is routed
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    match command {
                        Some(UdpCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.dispatch(from, &buf[..len]),
                        // ICMP unreachable and friends surface here; keep serving
                        Err(e) => tracing::debug!("Datagram receive error: {}", e),
                    }
                }
            }
        }

        for open in self.writers.values() {
            open.store(false, Ordering::SeqCst);
        }
        tracing::debug!("Datagram socket {:?} closed", self.socket.local_addr().ok());
    }

    fn handle_command(&mut self, command: UdpCommand) {
        match command {
            UdpCommand::RegisterRead { key, handler, reply } => {
                reply(self.readers.insert(key, handler));
            }
            UdpCommand::DeregisterRead { key } => {
                self.readers.remove(&key);
            }
            UdpCommand::RegisterWrite { key, open, reply } => {
                let added = match self.writers.get(&key) {
                    Some(existing) if existing.load(Ordering::SeqCst) => false,
                    _ => {
                        self.writers.insert(key, open);
                        true
                    }
                };
                let _ = reply.send(added);
            }
            UdpCommand::DeregisterWrite { key } => {
                if let Some(open) = self.writers.remove(&key) {
                    open.store(false, Ordering::SeqCst);
                }
            }
            UdpCommand::DeregisterHost { host } => {
                self.readers.retain(|(reader_host, _)| *reader_host != host);
                self.writers.retain(|(target, _), open| {
                    if target.ip() == host {
                        open.store(false, Ordering::SeqCst);
                        false
                    } else {
                        true
                    }
                });
            }
            UdpCommand::Shutdown => {}
        }
    }

    fn dispatch(&mut self, from: SocketAddr, datagram: &[u8]) {
        let Some(channel) = peek_channel_id(datagram) else {
            tracing::trace!("Ignoring runt datagram from {}", from);
            return;
        };
        self.readers.dispatch(&(from.ip(), channel), datagram);
    }
}
