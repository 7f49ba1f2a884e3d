//! Publisher task
//!
//! Owns the published controllers, the browse subscription and the link to
//! the connected browser. Controller observers and the connection report
//! back through the same command queue, so changes go out in the order the
//! controllers applied them.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::{PublisherDelegate, PublisherError, PublisherResult};
use crate::config::PublishMode;
use crate::controller::{Controller, ControllerSnapshot, ObserverId, StateChange};
use crate::discovery::{BrowseEvent, DiscoveryError, ServiceDiscovery, ServiceRecord};
use crate::network::{
    ConnectionEvent, ConnectionId, NetworkConfig, NetworkResult, TcpConnection, TcpHandle, TcpWriteChannel,
    UdpMultiplexer, UdpWriteChannel,
};
use crate::protocol::{
    reliable, unreliable, ButtonChanged, ConnectionStatus, ControllerConnected, ControllerDisconnected,
    ControllerIndex, ControllerName, GamepadMessage, Indexed, JoystickChanged, SetLayout,
};

pub(crate) enum PublisherCommand {
    AddController(Controller),
    RemoveController(ControllerIndex),
    Start {
        reply: oneshot::Sender<PublisherResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Connect {
        record: ServiceRecord,
        reply: oneshot::Sender<PublisherResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Browse(BrowseEvent),
    Snapshot {
        index: ControllerIndex,
        snapshot: ControllerSnapshot,
    },
    Changed {
        index: ControllerIndex,
        change: StateChange,
    },
    Connection {
        id: ConnectionId,
        event: ConnectionEvent,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    Shutdown,
}

/// Publisher tuning taken from the configuration
#[derive(Debug, Clone)]
pub(crate) struct PublisherSettings {
    pub name: String,
    pub service_type: String,
    pub network: NetworkConfig,
    pub publish_mode: PublishMode,
    pub auto_connect: bool,
}

struct Published {
    controller: Controller,
    observer: ObserverId,
    /// Mirror of the controller, known once its first snapshot arrived
    snapshot: Option<ControllerSnapshot>,
}

/// Channels to the connected browser
struct Link {
    record: ServiceRecord,
    connection: TcpHandle,
    connected: TcpWriteChannel<ControllerConnected>,
    disconnected: TcpWriteChannel<ControllerDisconnected>,
    names: TcpWriteChannel<Indexed<ControllerName>>,
    layouts: TcpWriteChannel<Indexed<SetLayout>>,
    input: UdpMultiplexer,
    gamepads: UdpWriteChannel<Indexed<GamepadMessage>>,
    joysticks: UdpWriteChannel<Indexed<JoystickChanged>>,
    buttons: UdpWriteChannel<Indexed<ButtonChanged>>,
}

impl Link {
    fn announce(&self, index: ControllerIndex, snapshot: &ControllerSnapshot, fallback_name: &str) {
        let name = snapshot.name.clone().unwrap_or_else(|| fallback_name.to_string());
        let message = ControllerConnected::new(index, snapshot.gamepad.layout, Some(name));
        tracing::debug!("Announcing controller {} to {}", index, self.record.name);
        log_send(self.connected.send(message));
    }

    fn close(&self) {
        self.connection.disconnect();
        self.input.close();
    }
}

fn log_send(result: NetworkResult<()>) {
    if let Err(e) = result {
        tracing::trace!("Dropped outbound message: {}", e);
    }
}

/// Local address to bind the input socket on when talking to `target`
fn input_bind_address(bind: IpAddr, target: SocketAddr) -> IpAddr {
    match (bind, target) {
        (IpAddr::V4(v4), SocketAddr::V6(_)) if v4.is_unspecified() => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        _ => bind,
    }
}

pub(crate) struct PublisherActor {
    settings: PublisherSettings,
    discovery: Arc<dyn ServiceDiscovery>,
    delegate: Arc<dyn PublisherDelegate>,
    commands: mpsc::UnboundedSender<PublisherCommand>,
    controllers: BTreeMap<ControllerIndex, Published>,
    link: Option<Link>,
    browsing: bool,
}

impl PublisherActor {
    pub(crate) fn spawn(
        settings: PublisherSettings,
        discovery: Arc<dyn ServiceDiscovery>,
        delegate: Arc<dyn PublisherDelegate>,
    ) -> mpsc::UnboundedSender<PublisherCommand> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let actor = Self {
            settings,
            discovery,
            delegate,
            commands: commands.clone(),
            controllers: BTreeMap::new(),
            link: None,
            browsing: false,
        };
        tokio::spawn(actor.run(receiver));
        commands
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<PublisherCommand>) {
        while let Some(command) = receiver.recv().await {
            match command {
                PublisherCommand::AddController(controller) => self.add_controller(controller),
                PublisherCommand::RemoveController(index) => self.remove_controller(index),
                PublisherCommand::Start { reply } => {
                    let _ = reply.send(self.start());
                }
                PublisherCommand::Stop { reply } => {
                    self.stop();
                    let _ = reply.send(());
                }
                PublisherCommand::Connect { record, reply } => {
                    let _ = reply.send(self.connect(record).await);
                }
                PublisherCommand::Disconnect { reply } => {
                    self.disconnect();
                    let _ = reply.send(());
                }
                PublisherCommand::Browse(event) => self.browse_event(event).await,
                PublisherCommand::Snapshot { index, snapshot } => self.snapshot(index, snapshot),
                PublisherCommand::Changed { index, change } => self.changed(index, change),
                PublisherCommand::Connection { id, event } => self.connection_event(id, event),
                PublisherCommand::Status { reply } => {
                    let status = if self.link.is_some() {
                        ConnectionStatus::Connected
                    } else {
                        ConnectionStatus::Disconnected
                    };
                    let _ = reply.send(status);
                }
                PublisherCommand::Shutdown => {
                    self.stop();
                    break;
                }
            }
        }

        for published in self.controllers.values() {
            published.controller.remove_observer(published.observer);
        }
        tracing::debug!("Publisher {} stopped", self.settings.name);
    }

    fn add_controller(&mut self, controller: Controller) {
        let index = controller.index();
        if self.controllers.contains_key(&index) {
            tracing::warn!("Controller {} is already published", index);
            return;
        }

        // Snapshot and listener are installed in one step, so the mirror
        // sees every change after the snapshot exactly once
        let observer = ObserverId::next();
        let commands = self.commands.clone();
        controller.with_state(move |state| {
            let _ = commands.send(PublisherCommand::Snapshot {
                index,
                snapshot: state.snapshot(),
            });
            state.insert_listener(
                observer,
                Box::new(move |change: &StateChange| {
                    let _ = commands.send(PublisherCommand::Changed {
                        index,
                        change: change.clone(),
                    });
                }),
            );
        });

        tracing::info!("Publishing controller {}", index);
        self.controllers.insert(
            index,
            Published {
                controller,
                observer,
                snapshot: None,
            },
        );
    }

    fn remove_controller(&mut self, index: ControllerIndex) {
        let Some(published) = self.controllers.remove(&index) else {
            tracing::debug!("Controller {} is not published", index);
            return;
        };
        published.controller.remove_observer(published.observer);

        if let Some(link) = &self.link {
            if published.snapshot.is_some() {
                log_send(link.disconnected.send(ControllerDisconnected { index }));
            }
        }
        tracing::info!("Stopped publishing controller {}", index);
    }

    fn start(&mut self) -> PublisherResult<()> {
        if self.browsing {
            return Err(PublisherError::AlreadyBrowsing);
        }

        let mut events = self.discovery.browse(&self.settings.service_type)?;
        self.browsing = true;

        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if commands.send(PublisherCommand::Browse(event)).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    fn stop(&mut self) {
        if std::mem::replace(&mut self.browsing, false) {
            if let Err(e) = self.discovery.stop_browse(&self.settings.service_type) {
                tracing::warn!("Could not stop browsing: {}", e);
            }
        }
        self.disconnect();
    }

    async fn browse_event(&mut self, event: BrowseEvent) {
        match event {
            BrowseEvent::Found(record) => {
                tracing::info!("Found browser {}", record.full_name());
                self.delegate.service_discovered(&record);

                if self.settings.auto_connect && self.link.is_none() {
                    if let Err(e) = self.connect(record).await {
                        tracing::warn!("Automatic connection failed: {}", e);
                        self.delegate.encountered_error(e);
                    }
                }
            }
            BrowseEvent::Lost { full_name } => {
                tracing::info!("Lost browser {}", full_name);
                self.delegate.service_lost(&full_name);
            }
        }
    }

    async fn connect(&mut self, record: ServiceRecord) -> PublisherResult<()> {
        if self.link.is_some() {
            return Err(PublisherError::AlreadyConnected);
        }

        // A zero or missing port means the browser has not published one yet
        let input_port = record
            .metadata
            .input_port()
            .ok_or_else(|| DiscoveryError::MissingMetadata(record.full_name()))?;
        let addr = self.discovery.resolve(&record).await?;

        let link = self.open_link(record, addr, input_port).await?;
        for (index, published) in &self.controllers {
            if let Some(snapshot) = &published.snapshot {
                link.announce(*index, snapshot, &self.settings.name);
            }
        }

        tracing::info!("Connected to browser {} at {}", link.record.name, addr);
        self.delegate.connected(&link.record);
        self.link = Some(link);
        Ok(())
    }

    async fn open_link(&self, record: ServiceRecord, addr: SocketAddr, input_port: u16) -> PublisherResult<Link> {
        let network = &self.settings.network;
        let mut connection = TcpConnection::connect(addr, network.connect_timeout(), network.max_frame_size).await?;
        let connected = connection.register_write_channel(reliable::CONTROLLER_CONNECTED)?;
        let disconnected = connection.register_write_channel(reliable::CONTROLLER_DISCONNECTED)?;
        let names = connection.register_write_channel(reliable::CONTROLLER_NAME)?;
        let layouts = connection.register_write_channel(reliable::CONTROLLER_LAYOUT)?;

        let target = SocketAddr::new(addr.ip(), input_port);
        let input = UdpMultiplexer::connect(input_bind_address(network.bind_address, target), target).await?;
        let gamepads = input.register_write_channel(unreliable::GAMEPAD, target).await?;
        let joysticks = input.register_write_channel(unreliable::JOYSTICK, target).await?;
        let buttons = input.register_write_channel(unreliable::BUTTON, target).await?;

        let id = connection.id();
        let commands = self.commands.clone();
        let connection = connection.start(move |event| {
            let _ = commands.send(PublisherCommand::Connection { id, event });
        });

        Ok(Link {
            record,
            connection,
            connected,
            disconnected,
            names,
            layouts,
            input,
            gamepads,
            joysticks,
            buttons,
        })
    }

    /// Say goodbye for every controller and drop the link
    fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        for (index, published) in &self.controllers {
            if published.snapshot.is_some() {
                log_send(link.disconnected.send(ControllerDisconnected { index: *index }));
            }
        }
        link.close();

        tracing::info!("Disconnected from browser {}", link.record.name);
        self.delegate.disconnected(&link.record);
    }

    fn connection_event(&mut self, id: ConnectionId, event: ConnectionEvent) {
        if self.link.as_ref().map(|link| link.connection.id()) != Some(id) {
            tracing::debug!("Ignoring event of stale connection {}", id);
            return;
        }

        match event {
            ConnectionEvent::Error(e) => self.delegate.encountered_error(e.into()),
            ConnectionEvent::Disconnected => {
                if let Some(link) = self.link.take() {
                    link.input.close();
                    tracing::info!("Browser {} went away", link.record.name);
                    self.delegate.disconnected(&link.record);
                }
            }
        }
    }

    fn snapshot(&mut self, index: ControllerIndex, snapshot: ControllerSnapshot) {
        let Some(published) = self.controllers.get_mut(&index) else {
            return;
        };
        if let Some(link) = &self.link {
            link.announce(index, &snapshot, &self.settings.name);
        }
        published.snapshot = Some(snapshot);
    }

    fn changed(&mut self, index: ControllerIndex, change: StateChange) {
        let Some(snapshot) = self
            .controllers
            .get_mut(&index)
            .and_then(|published| published.snapshot.as_mut())
        else {
            return;
        };

        // Keep the mirror current even while unlinked
        let input_changed = match &change {
            StateChange::Status { new, .. } => {
                snapshot.status = *new;
                false
            }
            StateChange::Layout { new, .. } => {
                snapshot.gamepad.set_layout(*new);
                false
            }
            StateChange::Name { new, .. } => {
                snapshot.name = new.clone();
                false
            }
            StateChange::Button { button, new, .. } => {
                if let Some(state) = new {
                    snapshot.gamepad.set_button(*button, *state);
                }
                new.is_some()
            }
            StateChange::Joystick { joystick, new, .. } => {
                if let Some(state) = new {
                    snapshot.gamepad.set_joystick(*joystick, *state);
                }
                new.is_some()
            }
        };

        let Some(link) = &self.link else {
            return;
        };

        match change {
            StateChange::Status { .. } => {}
            StateChange::Layout { new, .. } => {
                log_send(link.layouts.send(Indexed::new(index, SetLayout { layout: new })));
            }
            StateChange::Name { new, .. } => {
                let name = new.unwrap_or_default();
                log_send(link.names.send(Indexed::new(index, ControllerName { name })));
            }
            _ if !input_changed => {}
            _ if self.settings.publish_mode == PublishMode::FullState => {
                log_send(link.gamepads.send(Indexed::new(index, snapshot.gamepad.clone())));
            }
            StateChange::Button { button, new: Some(state), .. } => {
                log_send(link.buttons.send(Indexed::new(index, ButtonChanged { button, state })));
            }
            StateChange::Joystick { joystick, new: Some(state), .. } => {
                log_send(link.joysticks.send(Indexed::new(index, JoystickChanged { joystick, state })));
            }
            StateChange::Button { .. } | StateChange::Joystick { .. } => {}
        }
    }
}
