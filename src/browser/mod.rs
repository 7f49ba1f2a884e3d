//! Controller browser - the receiving role
//!
//! The browser advertises itself, accepts control connections from
//! publishers and mirrors their controllers. It also takes controllers
//! from a local hardware-polling collaborator. Every controller it knows
//! about, remote or native, is reported through a [`BrowserDelegate`].

mod registry;

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::controller::{Controller, ControllerMessage};
use crate::discovery::{self, Advertisement, DiscoveryError, ServiceDiscovery};
use crate::network::{NetworkError, TcpConnection, UdpMultiplexer};
use crate::protocol::{GamepadLayout, ServiceMetadata};

use registry::{PeerRegistry, RegistryCommand, RegistrySettings};

/// Browser errors
#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Browser already running")]
    AlreadyRunning,

    #[error("Browser not running")]
    NotRunning,

    #[error("Remote controllers are not accepted by this browser")]
    RemoteDisabled,
}

pub type BrowserResult<T> = Result<T, BrowserError>;

/// Where a controller comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    /// Made-for-platform wireless gamepad
    Mfi,
    /// Generic HID device
    Hid,
    /// Controller mirrored from a publisher on the network
    Remote,
}

/// Identity a hardware-polling collaborator gives one physical device
pub type NativeId = u64;

/// Receives controller lifecycle notifications
///
/// Called from the registry task, in the order things happened.
pub trait BrowserDelegate: Send + Sync {
    fn controller_connected(&self, _controller: &Controller, _kind: ControllerType) {}

    fn controller_disconnected(&self, _controller: &Controller) {}

    fn encountered_error(&self, _error: BrowserError) {}
}

/// Events emitted by the browser when a channel is used as delegate
#[derive(Debug)]
pub enum BrowserEvent {
    ControllerConnected {
        controller: Controller,
        kind: ControllerType,
    },
    ControllerDisconnected {
        controller: Controller,
    },
    Error(BrowserError),
}

impl BrowserDelegate for mpsc::UnboundedSender<BrowserEvent> {
    fn controller_connected(&self, controller: &Controller, kind: ControllerType) {
        let _ = self.send(BrowserEvent::ControllerConnected {
            controller: controller.clone(),
            kind,
        });
    }

    fn controller_disconnected(&self, controller: &Controller) {
        let _ = self.send(BrowserEvent::ControllerDisconnected {
            controller: controller.clone(),
        });
    }

    fn encountered_error(&self, error: BrowserError) {
        let _ = self.send(BrowserEvent::Error(error));
    }
}

/// Ports the browser ended up bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundPorts {
    pub control: u16,
    pub input: u16,
}

struct Running {
    ports: BoundPorts,
    advertisement: Option<String>,
    shutdown_tx: mpsc::Sender<()>,
}

/// The receiving side of padlink
pub struct ControllerBrowser {
    name: String,
    config: Config,
    discovery: Arc<dyn ServiceDiscovery>,
    registry: mpsc::UnboundedSender<RegistryCommand>,
    running: Option<Running>,
}

impl ControllerBrowser {
    /// Create a browser; must be called within a tokio runtime
    pub fn new(
        name: impl Into<String>,
        config: Config,
        discovery: Arc<dyn ServiceDiscovery>,
        delegate: Arc<dyn BrowserDelegate>,
    ) -> Self {
        let settings = RegistrySettings {
            grace_period: config.grace_period(),
            coalesce: config.coalesce_interval(),
            accepted: config.browser.controller_types.iter().copied().collect(),
        };

        Self {
            name: name.into(),
            config,
            discovery,
            registry: PeerRegistry::spawn(settings, delegate),
            running: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind the control listener and the input socket, then advertise
    ///
    /// Only needed for remote controllers. Native controllers are taken in
    /// whether or not the browser runs.
    pub async fn start(&mut self) -> BrowserResult<BoundPorts> {
        if self.running.is_some() {
            return Err(BrowserError::AlreadyRunning);
        }
        if !self.accepts(ControllerType::Remote) {
            return Err(BrowserError::RemoteDisabled);
        }

        let network = self.config.network_config();
        let service_type = discovery::service_type(&self.config.discovery.service_identifier)?;

        let bind_addr = SocketAddr::new(network.bind_address, network.control_port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| NetworkError::Bind { addr: bind_addr, source })?;
        let control = listener.local_addr().map_err(NetworkError::from)?;
        tracing::info!("Control listener on {}", control);

        let udp = UdpMultiplexer::listen(network.bind_address, network.input_port).await?;
        let ports = BoundPorts {
            control: control.port(),
            input: udp.local_port(),
        };
        let _ = self.registry.send(RegistryCommand::AttachInput(Arc::new(udp)));

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let registry = self.registry.clone();
        let max_frame_size = network.max_frame_size;

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);
                                match TcpConnection::new(stream, max_frame_size) {
                                    Ok(connection) => {
                                        if registry.send(RegistryCommand::Accepted(connection)).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => tracing::warn!("Dropping connection from {}: {}", addr, e),
                                }
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Control listener shutdown requested");
                        break;
                    }
                }
            }
        });

        let mut advertisement = None;
        if self.config.discovery.enabled {
            let ad = Advertisement {
                name: self.name.clone(),
                service_type,
                port: ports.control,
                metadata: ServiceMetadata::with_input_port(ports.input),
            };
            let full_name = ad.full_name();
            if let Err(e) = self.discovery.advertise(ad) {
                drop(shutdown_tx);
                self.stop_network().await;
                return Err(e.into());
            }
            advertisement = Some(full_name);
        }

        self.running = Some(Running {
            ports,
            advertisement,
            shutdown_tx,
        });
        Ok(ports)
    }

    /// Withdraw the advertisement and drop every remote session
    ///
    /// Remote controllers are reported disconnected right away; native
    /// controllers are unaffected.
    pub async fn stop(&mut self) -> BrowserResult<()> {
        let running = self.running.take().ok_or(BrowserError::NotRunning)?;

        if let Some(full_name) = &running.advertisement {
            if let Err(e) = self.discovery.withdraw(full_name) {
                tracing::warn!("Could not withdraw {}: {}", full_name, e);
            }
        }
        let _ = running.shutdown_tx.send(()).await;
        self.stop_network().await;

        tracing::info!("Browser {} stopped", self.name);
        Ok(())
    }

    async fn stop_network(&self) {
        let (reply, done) = oneshot::channel();
        if self.registry.send(RegistryCommand::StopNetwork { reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Whether controllers of `kind` are taken in
    pub fn accepts(&self, kind: ControllerType) -> bool {
        self.config.browser.controller_types.contains(&kind)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn ports(&self) -> Option<BoundPorts> {
        self.running.as_ref().map(|running| running.ports)
    }

    /// A hardware controller appeared, or came back
    pub fn native_connected(
        &self,
        id: NativeId,
        kind: ControllerType,
        layout: GamepadLayout,
        name: Option<String>,
    ) {
        let _ = self.registry.send(RegistryCommand::NativeConnected { id, kind, layout, name });
    }

    /// A hardware controller's transport dropped
    pub fn native_disconnected(&self, id: NativeId) {
        let _ = self.registry.send(RegistryCommand::NativeDisconnected { id });
    }

    /// Input reported by the hardware-polling collaborator
    pub fn native_input(&self, id: NativeId, message: impl Into<ControllerMessage>) {
        let _ = self.registry.send(RegistryCommand::NativeInput {
            id,
            message: message.into(),
        });
    }

    /// Every controller currently held, including those in a grace period
    pub async fn controllers(&self) -> Vec<(Controller, ControllerType)> {
        let (reply, response) = oneshot::channel();
        if self.registry.send(RegistryCommand::Controllers { reply }).is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }
}

impl Drop for ControllerBrowser {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            if let Some(full_name) = &running.advertisement {
                let _ = self.discovery.withdraw(full_name);
            }
        }
        let _ = self.registry.send(RegistryCommand::Shutdown);
    }
}
