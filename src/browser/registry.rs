//! Peer and controller registry
//!
//! The registry task is the single owner of every controller the browser
//! knows about, of every remote peer session and of their channels. All
//! inputs (accepted connections, inbound frames, native hardware events,
//! grace timers) reach it as [`RegistryCommand`]s.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::{BrowserDelegate, BrowserError, ControllerType, NativeId};
use crate::controller::{Controller, ControllerMessage, ControllerOptions};
use crate::network::{ConnectionEvent, ConnectionId, NetworkError, NetworkResult, TcpConnection, TcpHandle, UdpMultiplexer};
use crate::protocol::{
    reliable, unreliable, ButtonChanged, ConnectionStatus, ControllerConnected, ControllerDisconnected,
    ControllerIndex, ControllerName, GamepadLayout, GamepadMessage, Indexed, JoystickChanged, SetLayout,
    PROTOCOL_VERSION,
};

/// Messages a remote peer can send, after channel demultiplexing
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RemoteMessage {
    Connected(ControllerConnected),
    Disconnected(ControllerDisconnected),
    Name(Indexed<ControllerName>),
    Layout(Indexed<SetLayout>),
    Input {
        index: ControllerIndex,
        message: ControllerMessage,
    },
    Gamepad(Indexed<GamepadMessage>),
}

pub(crate) enum RegistryCommand {
    AttachInput(Arc<UdpMultiplexer>),
    Accepted(TcpConnection),
    Remote {
        host: IpAddr,
        message: RemoteMessage,
    },
    Connection {
        host: IpAddr,
        id: ConnectionId,
        event: ConnectionEvent,
    },
    InputChannelFailed {
        host: IpAddr,
        error: NetworkError,
    },
    NativeConnected {
        id: NativeId,
        kind: ControllerType,
        layout: GamepadLayout,
        name: Option<String>,
    },
    NativeDisconnected {
        id: NativeId,
    },
    NativeInput {
        id: NativeId,
        message: ControllerMessage,
    },
    GraceExpired {
        index: ControllerIndex,
        generation: u64,
    },
    Controllers {
        reply: oneshot::Sender<Vec<(Controller, ControllerType)>>,
    },
    StopNetwork {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Registry tuning taken from the configuration
#[derive(Debug, Clone)]
pub(crate) struct RegistrySettings {
    pub grace_period: Duration,
    pub coalesce: Option<Duration>,
    /// Controller types the browser takes in
    pub accepted: HashSet<ControllerType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Native(NativeId),
    Remote {
        host: IpAddr,
        index: ControllerIndex,
    },
}

#[derive(Debug)]
struct Entry {
    controller: Controller,
    kind: ControllerType,
    origin: Origin,
    /// Generation of the pending grace timer, set while the transport is gone
    grace: Option<u64>,
}

/// Server-side session of one remote host
#[derive(Debug, Default)]
struct RemotePeer {
    /// Peer's own controller index to the local one
    controllers: HashMap<ControllerIndex, ControllerIndex>,
    connection: Option<TcpHandle>,
    input_channels: bool,
}

pub(crate) struct PeerRegistry {
    settings: RegistrySettings,
    delegate: Arc<dyn BrowserDelegate>,
    commands: mpsc::UnboundedSender<RegistryCommand>,
    entries: BTreeMap<ControllerIndex, Entry>,
    peers: HashMap<IpAddr, RemotePeer>,
    natives: HashMap<NativeId, ControllerIndex>,
    input: Option<Arc<UdpMultiplexer>>,
    next_generation: u64,
}

impl PeerRegistry {
    /// Spawn the registry task and return its command queue
    pub(crate) fn spawn(
        settings: RegistrySettings,
        delegate: Arc<dyn BrowserDelegate>,
    ) -> mpsc::UnboundedSender<RegistryCommand> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let registry = Self {
            settings,
            delegate,
            commands: commands.clone(),
            entries: BTreeMap::new(),
            peers: HashMap::new(),
            natives: HashMap::new(),
            input: None,
            next_generation: 0,
        };
        tokio::spawn(registry.run(receiver));
        commands
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<RegistryCommand>) {
        while let Some(command) = receiver.recv().await {
            match command {
                RegistryCommand::AttachInput(udp) => self.input = Some(udp),
                RegistryCommand::Accepted(connection) => self.accept(connection),
                RegistryCommand::Remote { host, message } => self.remote(host, message),
                RegistryCommand::Connection { host, id, event } => self.connection_event(host, id, event),
                RegistryCommand::InputChannelFailed { host, error } => {
                    tracing::error!("Could not open input channels for {}: {}", host, error);
                    self.delegate.encountered_error(BrowserError::Network(error));
                }
                RegistryCommand::NativeConnected { id, kind, layout, name } => {
                    self.native_connected(id, kind, layout, name)
                }
                RegistryCommand::NativeDisconnected { id } => self.native_disconnected(id),
                RegistryCommand::NativeInput { id, message } => {
                    match self.natives.get(&id).and_then(|index| self.entries.get(index)) {
                        Some(entry) => {
                            entry.controller.send(message);
                        }
                        None => tracing::trace!("Input for unknown native controller {}", id),
                    }
                }
                RegistryCommand::GraceExpired { index, generation } => self.grace_expired(index, generation),
                RegistryCommand::Controllers { reply } => {
                    let controllers = self
                        .entries
                        .values()
                        .map(|entry| (entry.controller.clone(), entry.kind))
                        .collect();
                    let _ = reply.send(controllers);
                }
                RegistryCommand::StopNetwork { reply } => {
                    self.stop_network();
                    let _ = reply.send(());
                }
                RegistryCommand::Shutdown => {
                    self.stop_network();
                    break;
                }
            }
        }
        tracing::debug!("Controller registry stopped");
    }

    fn accept(&mut self, mut connection: TcpConnection) {
        let host = connection.peer_addr().ip();
        let id = connection.id();

        if let Err(e) = self.register_control_channels(&mut connection, host) {
            self.delegate.encountered_error(BrowserError::Network(e));
            return;
        }

        let commands = self.commands.clone();
        let handle = connection.start(move |event| {
            let _ = commands.send(RegistryCommand::Connection { host, id, event });
        });

        tracing::info!("Control connection {} from {}", id, host);
        let peer = self.peers.entry(host).or_default();
        if let Some(previous) = peer.connection.replace(handle) {
            tracing::debug!("Replacing control connection {} from {}", previous.id(), host);
            previous.disconnect();
        }

        // A host back within the grace period gets its controllers back
        let held: Vec<ControllerIndex> = peer.controllers.values().copied().collect();
        for local in held {
            self.resume(local);
        }
    }

    fn register_control_channels(&self, connection: &mut TcpConnection, host: IpAddr) -> NetworkResult<()> {
        let tx = self.commands.clone();
        connection.register_read_channel(reliable::CONTROLLER_CONNECTED, move |m: ControllerConnected| {
            let _ = tx.send(RegistryCommand::Remote { host, message: RemoteMessage::Connected(m) });
        })?;
        let tx = self.commands.clone();
        connection.register_read_channel(reliable::CONTROLLER_DISCONNECTED, move |m: ControllerDisconnected| {
            let _ = tx.send(RegistryCommand::Remote { host, message: RemoteMessage::Disconnected(m) });
        })?;
        let tx = self.commands.clone();
        connection.register_read_channel(reliable::CONTROLLER_NAME, move |m: Indexed<ControllerName>| {
            let _ = tx.send(RegistryCommand::Remote { host, message: RemoteMessage::Name(m) });
        })?;
        let tx = self.commands.clone();
        connection.register_read_channel(reliable::CONTROLLER_LAYOUT, move |m: Indexed<SetLayout>| {
            let _ = tx.send(RegistryCommand::Remote { host, message: RemoteMessage::Layout(m) });
        })?;
        Ok(())
    }

    /// Enqueue the host's input channels on the datagram socket
    fn register_input_channels(&self, udp: &UdpMultiplexer, host: IpAddr) -> NetworkResult<()> {
        let tx = self.commands.clone();
        let failed = self.commands.clone();
        udp.submit_read_channel(
            unreliable::BUTTON,
            host,
            move |m: Indexed<ButtonChanged>| {
                let message = RemoteMessage::Input { index: m.index, message: m.message.into() };
                let _ = tx.send(RegistryCommand::Remote { host, message });
            },
            report_failure(failed, host),
        )?;
        let tx = self.commands.clone();
        let failed = self.commands.clone();
        udp.submit_read_channel(
            unreliable::JOYSTICK,
            host,
            move |m: Indexed<JoystickChanged>| {
                let message = RemoteMessage::Input { index: m.index, message: m.message.into() };
                let _ = tx.send(RegistryCommand::Remote { host, message });
            },
            report_failure(failed, host),
        )?;
        let tx = self.commands.clone();
        let failed = self.commands.clone();
        udp.submit_read_channel(
            unreliable::GAMEPAD,
            host,
            move |m: Indexed<GamepadMessage>| {
                let _ = tx.send(RegistryCommand::Remote { host, message: RemoteMessage::Gamepad(m) });
            },
            report_failure(failed, host),
        )?;
        Ok(())
    }

    fn remote(&mut self, host: IpAddr, message: RemoteMessage) {
        let (index, messages) = match message {
            RemoteMessage::Connected(announcement) => {
                self.remote_connected(host, announcement);
                return;
            }
            RemoteMessage::Disconnected(ControllerDisconnected { index }) => {
                if let Some(local) = self.remote_index(host, index) {
                    tracing::info!("{} withdrew controller {}", host, index);
                    self.remove(local);
                }
                return;
            }
            RemoteMessage::Name(Indexed { index, message }) => {
                let name = Some(message.name).filter(|name| !name.is_empty());
                (index, vec![ControllerMessage::SetName(name)])
            }
            RemoteMessage::Layout(Indexed { index, message }) => {
                (index, vec![ControllerMessage::SetLayout(message.layout)])
            }
            RemoteMessage::Input { index, message } => (index, vec![message]),
            RemoteMessage::Gamepad(Indexed { index, message }) => {
                (index, ControllerMessage::from_gamepad(&message))
            }
        };

        let Some(entry) = self.remote_index(host, index).and_then(|local| self.entries.get(&local)) else {
            tracing::trace!("Discarding message for unknown controller {} of {}", index, host);
            return;
        };
        for message in messages {
            entry.controller.send(message);
        }
    }

    fn remote_connected(&mut self, host: IpAddr, announcement: ControllerConnected) {
        if announcement.version != PROTOCOL_VERSION {
            tracing::warn!(
                "Controller {} of {} speaks protocol {}, expected {}",
                announcement.index,
                host,
                announcement.version,
                PROTOCOL_VERSION
            );
        }

        let needs_channels = {
            let peer = self.peers.entry(host).or_default();
            !std::mem::replace(&mut peer.input_channels, true)
        };
        if needs_channels {
            if let Some(udp) = self.input.clone() {
                if let Err(error) = self.register_input_channels(&udp, host) {
                    let _ = self.commands.send(RegistryCommand::InputChannelFailed { host, error });
                }
            }
        }

        let ControllerConnected { index, layout, name, .. } = announcement;
        match self.remote_index(host, index) {
            Some(local) => {
                self.resume(local);
                if let Some(entry) = self.entries.get(&local) {
                    entry.controller.send(ControllerMessage::SetLayout(layout));
                    entry.controller.send(ControllerMessage::SetName(name));
                }
            }
            None => {
                let origin = Origin::Remote { host, index };
                if let Some(local) = self.connect(ControllerType::Remote, origin, layout, name) {
                    if let Some(peer) = self.peers.get_mut(&host) {
                        peer.controllers.insert(index, local);
                    }
                }
            }
        }
    }

    fn connection_event(&mut self, host: IpAddr, id: ConnectionId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Error(e) => {
                self.delegate.encountered_error(BrowserError::Network(e));
            }
            ConnectionEvent::Disconnected => {
                let Some(peer) = self.peers.get_mut(&host) else {
                    return;
                };
                if peer.connection.as_ref().map(TcpHandle::id) != Some(id) {
                    tracing::debug!("Ignoring close of stale connection {} from {}", id, host);
                    return;
                }
                peer.connection = None;

                let controllers: Vec<ControllerIndex> = peer.controllers.values().copied().collect();
                if controllers.is_empty() {
                    self.teardown_peer(host);
                    return;
                }
                tracing::info!("Lost {}, holding {} controller(s)", host, controllers.len());
                for local in controllers {
                    self.suspend(local);
                }
            }
        }
    }

    fn native_connected(&mut self, id: NativeId, kind: ControllerType, layout: GamepadLayout, name: Option<String>) {
        if !self.settings.accepted.contains(&kind) {
            tracing::debug!("Ignoring native controller {}: {:?} controllers are not accepted", id, kind);
            return;
        }
        match self.natives.get(&id).copied() {
            Some(local) => {
                tracing::debug!("Native controller {} is back", id);
                self.resume(local);
            }
            None => {
                if let Some(local) = self.connect(kind, Origin::Native(id), layout, name) {
                    self.natives.insert(id, local);
                }
            }
        }
    }

    fn native_disconnected(&mut self, id: NativeId) {
        match self.natives.get(&id).copied() {
            Some(local) => self.suspend(local),
            None => tracing::debug!("Disconnect for unknown native controller {}", id),
        }
    }

    fn remote_index(&self, host: IpAddr, index: ControllerIndex) -> Option<ControllerIndex> {
        self.peers.get(&host)?.controllers.get(&index).copied()
    }

    /// Lowest index not held by any controller, including those in grace
    fn allocate(&self) -> Option<ControllerIndex> {
        (0..=ControllerIndex::MAX).find(|index| !self.entries.contains_key(index))
    }

    fn connect(
        &mut self,
        kind: ControllerType,
        origin: Origin,
        layout: GamepadLayout,
        name: Option<String>,
    ) -> Option<ControllerIndex> {
        let Some(index) = self.allocate() else {
            tracing::error!("No free controller index for {:?}", origin);
            return None;
        };

        let options = match origin {
            Origin::Native(_) => ControllerOptions { coalesce: self.settings.coalesce },
            Origin::Remote { .. } => ControllerOptions::default(),
        };
        let controller = Controller::with_options(index, GamepadLayout::Regular, options);
        controller.send(ControllerMessage::SetLayout(layout));
        controller.send(ControllerMessage::SetName(name));
        controller.send(ControllerMessage::ConnectionChanged(ConnectionStatus::Connected));

        tracing::info!("Controller {} connected ({:?}, {:?})", index, kind, layout);
        self.entries.insert(
            index,
            Entry {
                controller: controller.clone(),
                kind,
                origin,
                grace: None,
            },
        );
        self.delegate.controller_connected(&controller, kind);
        Some(index)
    }

    fn resume(&mut self, index: ControllerIndex) {
        if let Some(entry) = self.entries.get_mut(&index) {
            if entry.grace.take().is_some() {
                tracing::info!("Controller {} reconnected within grace period", index);
                entry
                    .controller
                    .send(ControllerMessage::ConnectionChanged(ConnectionStatus::Connected));
            }
        }
    }

    fn suspend(&mut self, index: ControllerIndex) {
        let generation = self.next_generation;
        let Some(entry) = self.entries.get_mut(&index) else {
            return;
        };
        if entry.grace.is_some() {
            return;
        }
        self.next_generation += 1;
        entry.grace = Some(generation);
        entry
            .controller
            .send(ControllerMessage::ConnectionChanged(ConnectionStatus::Disconnected));

        tracing::debug!("Controller {} dropped, grace period started", index);
        let commands = self.commands.clone();
        let grace_period = self.settings.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            let _ = commands.send(RegistryCommand::GraceExpired { index, generation });
        });
    }

    fn grace_expired(&mut self, index: ControllerIndex, generation: u64) {
        let current = self.entries.get(&index).and_then(|entry| entry.grace);
        if current == Some(generation) {
            tracing::info!("Controller {} did not come back", index);
            self.remove(index);
        }
    }

    /// Forget a controller and tell the delegate
    fn remove(&mut self, index: ControllerIndex) {
        let Some(entry) = self.entries.remove(&index) else {
            return;
        };
        if entry.grace.is_none() {
            entry
                .controller
                .send(ControllerMessage::ConnectionChanged(ConnectionStatus::Disconnected));
        }

        match entry.origin {
            Origin::Native(id) => {
                self.natives.remove(&id);
            }
            Origin::Remote { host, index: remote } => {
                let orphaned = match self.peers.get_mut(&host) {
                    Some(peer) => {
                        peer.controllers.remove(&remote);
                        peer.controllers.is_empty() && peer.connection.is_none()
                    }
                    None => false,
                };
                if orphaned {
                    self.teardown_peer(host);
                }
            }
        }

        tracing::info!("Controller {} disconnected", index);
        self.delegate.controller_disconnected(&entry.controller);
    }

    fn teardown_peer(&mut self, host: IpAddr) {
        let Some(peer) = self.peers.remove(&host) else {
            return;
        };
        if let Some(connection) = peer.connection {
            connection.disconnect();
        }
        if peer.input_channels {
            if let Some(udp) = &self.input {
                udp.deregister_host(host);
            }
        }
        tracing::debug!("Session for {} closed", host);
    }

    /// Drop every remote session; remote controllers are gone immediately
    fn stop_network(&mut self) {
        let hosts: Vec<IpAddr> = self.peers.keys().copied().collect();
        for host in hosts {
            if let Some(peer) = self.peers.get_mut(&host) {
                if let Some(connection) = peer.connection.take() {
                    connection.disconnect();
                }
            }
            let controllers: Vec<ControllerIndex> = self
                .peers
                .get(&host)
                .map(|peer| peer.controllers.values().copied().collect())
                .unwrap_or_default();
            for local in controllers {
                self.remove(local);
            }
            self.teardown_peer(host);
        }

        if let Some(udp) = self.input.take() {
            udp.close();
        }
    }
}

/// Registration outcome handler that hands failures back to the registry
fn report_failure(
    commands: mpsc::UnboundedSender<RegistryCommand>,
    host: IpAddr,
) -> impl FnOnce(NetworkResult<()>) + Send + 'static {
    move |result| {
        if let Err(error) = result {
            let _ = commands.send(RegistryCommand::InputChannelFailed { host, error });
        }
    }
}
