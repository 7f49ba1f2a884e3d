//! Controller publisher - the sending role
//!
//! A publisher browses for controller browsers, connects to one and
//! streams the state of its local controllers to it: lifecycle, name and
//! layout over the stream connection, input over datagrams.

mod actor;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::controller::Controller;
use crate::discovery::{DiscoveryError, ServiceDiscovery, ServiceRecord};
use crate::network::NetworkError;
use crate::protocol::{ConnectionStatus, ControllerIndex};

use actor::{PublisherActor, PublisherCommand, PublisherSettings};

/// Publisher errors
#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Already browsing")]
    AlreadyBrowsing,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Publisher has shut down")]
    Stopped,
}

pub type PublisherResult<T> = Result<T, PublisherError>;

/// Receives publisher notifications
pub trait PublisherDelegate: Send + Sync {
    fn service_discovered(&self, _record: &ServiceRecord) {}

    fn service_lost(&self, _full_name: &str) {}

    fn connected(&self, _record: &ServiceRecord) {}

    fn disconnected(&self, _record: &ServiceRecord) {}

    fn encountered_error(&self, _error: PublisherError) {}
}

/// Events emitted by the publisher when a channel is used as delegate
#[derive(Debug)]
pub enum PublisherEvent {
    Discovered(ServiceRecord),
    Lost { full_name: String },
    Connected(ServiceRecord),
    Disconnected(ServiceRecord),
    Error(PublisherError),
}

impl PublisherDelegate for mpsc::UnboundedSender<PublisherEvent> {
    fn service_discovered(&self, record: &ServiceRecord) {
        let _ = self.send(PublisherEvent::Discovered(record.clone()));
    }

    fn service_lost(&self, full_name: &str) {
        let _ = self.send(PublisherEvent::Lost {
            full_name: full_name.to_string(),
        });
    }

    fn connected(&self, record: &ServiceRecord) {
        let _ = self.send(PublisherEvent::Connected(record.clone()));
    }

    fn disconnected(&self, record: &ServiceRecord) {
        let _ = self.send(PublisherEvent::Disconnected(record.clone()));
    }

    fn encountered_error(&self, error: PublisherError) {
        let _ = self.send(PublisherEvent::Error(error));
    }
}

/// The sending side of padlink
#[derive(Debug)]
pub struct ControllerPublisher {
    name: String,
    commands: mpsc::UnboundedSender<PublisherCommand>,
}

impl ControllerPublisher {
    /// Create a publisher; must be called within a tokio runtime
    ///
    /// Fails if the configured service identifier is invalid.
    pub fn new(
        name: impl Into<String>,
        config: &Config,
        discovery: Arc<dyn ServiceDiscovery>,
        delegate: Arc<dyn PublisherDelegate>,
    ) -> PublisherResult<Self> {
        let name = name.into();
        let service_type = crate::discovery::service_type(&config.discovery.service_identifier)?;

        let settings = PublisherSettings {
            name: name.clone(),
            service_type,
            network: config.network_config(),
            publish_mode: config.input.publish_mode,
            auto_connect: config.input.auto_connect,
        };

        Ok(Self {
            name,
            commands: PublisherActor::spawn(settings, discovery, delegate),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start mirroring `controller`; it is announced as soon as a browser is linked
    pub fn add_controller(&self, controller: Controller) {
        let _ = self.commands.send(PublisherCommand::AddController(controller));
    }

    /// Stop mirroring the controller published under `index`
    pub fn remove_controller(&self, index: ControllerIndex) {
        let _ = self.commands.send(PublisherCommand::RemoveController(index));
    }

    /// Browse for controller browsers
    pub async fn start(&self) -> PublisherResult<()> {
        self.request(|reply| PublisherCommand::Start { reply }).await?
    }

    /// Stop browsing and drop the current link
    pub async fn stop(&self) -> PublisherResult<()> {
        self.request(|reply| PublisherCommand::Stop { reply }).await
    }

    /// Link to a browser found while browsing
    pub async fn connect(&self, record: ServiceRecord) -> PublisherResult<()> {
        self.request(|reply| PublisherCommand::Connect { record, reply }).await?
    }

    /// Withdraw every controller from the linked browser and drop the link
    pub async fn disconnect(&self) -> PublisherResult<()> {
        self.request(|reply| PublisherCommand::Disconnect { reply }).await
    }

    pub async fn status(&self) -> PublisherResult<ConnectionStatus> {
        self.request(|reply| PublisherCommand::Status { reply }).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> PublisherCommand) -> PublisherResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| PublisherError::Stopped)?;
        response.await.map_err(|_| PublisherError::Stopped)
    }
}

impl Drop for ControllerPublisher {
    fn drop(&mut self) {
        let _ = self.commands.send(PublisherCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserEvent, ControllerBrowser, ControllerType};
    use crate::config::PublishMode;
    use crate::controller::{ControllerMessage, StateChange};
    use crate::discovery::LoopbackDiscovery;
    use crate::network::NetworkConfig;
    use crate::protocol::{
        ButtonKind, ButtonState, GamepadLayout, JoystickKind, JoystickState, ServiceMetadata,
    };
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(mode: PublishMode, auto_connect: bool) -> Config {
        let mut config = Config::default();
        config.network.bind_address = NetworkConfig::loopback().bind_address;
        config.session.grace_period_ms = 60_000;
        config.input.publish_mode = mode;
        config.input.auto_connect = auto_connect;
        config
    }

    async fn recv<T>(events: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    struct Setup {
        browser: ControllerBrowser,
        browser_events: mpsc::UnboundedReceiver<BrowserEvent>,
        publisher: ControllerPublisher,
        publisher_events: mpsc::UnboundedReceiver<PublisherEvent>,
        local: Controller,
    }

    /// A started browser and an auto-connecting publisher with one controller
    async fn linked(mode: PublishMode, layout: GamepadLayout) -> Setup {
        let config = test_config(mode, true);
        let discovery = Arc::new(LoopbackDiscovery::new());

        let (browser_tx, browser_events) = mpsc::unbounded_channel();
        let mut browser = ControllerBrowser::new("Living Room", config.clone(), discovery.clone(), Arc::new(browser_tx));
        browser.start().await.unwrap();

        let (publisher_tx, publisher_events) = mpsc::unbounded_channel();
        let publisher = ControllerPublisher::new("Phone", &config, discovery, Arc::new(publisher_tx)).unwrap();

        let local = Controller::spawn(0, layout);
        local.send(ControllerMessage::SetName(Some("Pad1".into())));
        publisher.add_controller(local.clone());
        publisher.start().await.unwrap();

        Setup {
            browser,
            browser_events,
            publisher,
            publisher_events,
            local,
        }
    }

    async fn mirrored(events: &mut mpsc::UnboundedReceiver<BrowserEvent>) -> Controller {
        match recv(events).await {
            BrowserEvent::ControllerConnected { controller, kind } => {
                assert_eq!(kind, ControllerType::Remote);
                controller
            }
            other => panic!("expected a mirrored controller, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_button_press_reaches_browser() {
        let mut setup = linked(PublishMode::Deltas, GamepadLayout::Regular).await;

        assert!(matches!(recv(&mut setup.publisher_events).await, PublisherEvent::Discovered(_)));
        match recv(&mut setup.publisher_events).await {
            PublisherEvent::Connected(record) => assert_eq!(record.name, "Living Room"),
            other => panic!("expected a connection, got {other:?}"),
        }

        let remote = mirrored(&mut setup.browser_events).await;
        let snapshot = remote.snapshot().await.unwrap();
        assert_eq!(snapshot.name.as_deref(), Some("Pad1"));
        assert_eq!(snapshot.gamepad.layout, GamepadLayout::Regular);

        let (tx, mut presses) = mpsc::unbounded_channel();
        remote.observe(move |change| {
            if let StateChange::Button { button: ButtonKind::A, new: Some(state), .. } = change {
                let _ = tx.send(*state);
            }
        });

        let pressed = ButtonState::new(1.0, true);
        setup.local.send(ControllerMessage::ButtonChanged(ButtonKind::A, pressed));
        assert_eq!(recv(&mut presses).await, pressed);
        assert_eq!(setup.publisher.status().await.unwrap(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_name_and_layout_follow_local_controller() {
        let mut setup = linked(PublishMode::Deltas, GamepadLayout::Regular).await;
        let remote = mirrored(&mut setup.browser_events).await;

        let (tx, mut changes) = mpsc::unbounded_channel();
        remote.observe(move |change| {
            if matches!(change, StateChange::Name { .. } | StateChange::Layout { .. }) {
                let _ = tx.send(change.clone());
            }
        });

        setup.local.send(ControllerMessage::SetLayout(GamepadLayout::Extended));
        setup.local.send(ControllerMessage::SetName(Some("Renamed".into())));

        assert_eq!(
            recv(&mut changes).await,
            StateChange::Layout { old: GamepadLayout::Regular, new: GamepadLayout::Extended }
        );
        assert_eq!(
            recv(&mut changes).await,
            StateChange::Name { old: Some("Pad1".into()), new: Some("Renamed".into()) }
        );
    }

    #[tokio::test]
    async fn test_full_state_mode() {
        let mut setup = linked(PublishMode::FullState, GamepadLayout::Micro).await;
        let remote = mirrored(&mut setup.browser_events).await;

        let up = JoystickState::new(0.0, -1.0);
        let (tx, mut moves) = mpsc::unbounded_channel();
        remote.observe(move |change| {
            if let StateChange::Joystick { joystick: JoystickKind::Dpad, new: Some(state), .. } = change {
                if *state == up {
                    let _ = tx.send(*state);
                }
            }
        });

        setup.local.send(ControllerMessage::JoystickChanged(JoystickKind::Dpad, up));
        assert!(recv(&mut moves).await.up());
    }

    #[tokio::test]
    async fn test_remove_controller_withdraws_immediately() {
        let mut setup = linked(PublishMode::Deltas, GamepadLayout::Regular).await;
        let remote = mirrored(&mut setup.browser_events).await;

        setup.publisher.remove_controller(0);
        match recv(&mut setup.browser_events).await {
            BrowserEvent::ControllerDisconnected { controller } => assert_eq!(controller.index(), remote.index()),
            other => panic!("expected a disconnection, got {other:?}"),
        }
        assert!(setup.browser.controllers().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_withdraws_every_controller() {
        let mut setup = linked(PublishMode::Deltas, GamepadLayout::Regular).await;
        let second = Controller::spawn(1, GamepadLayout::Micro);
        mirrored(&mut setup.browser_events).await;
        setup.publisher.add_controller(second);
        mirrored(&mut setup.browser_events).await;

        setup.publisher.disconnect().await.unwrap();
        for _ in 0..2 {
            assert!(matches!(
                recv(&mut setup.browser_events).await,
                BrowserEvent::ControllerDisconnected { .. }
            ));
        }
        assert_eq!(setup.publisher.status().await.unwrap(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_browser_stop_is_reported() {
        let mut setup = linked(PublishMode::Deltas, GamepadLayout::Regular).await;
        mirrored(&mut setup.browser_events).await;

        setup.browser.stop().await.unwrap();
        loop {
            match recv(&mut setup.publisher_events).await {
                PublisherEvent::Disconnected(record) => {
                    assert_eq!(record.name, "Living Room");
                    break;
                }
                PublisherEvent::Discovered(_) | PublisherEvent::Connected(_) | PublisherEvent::Lost { .. } => {}
                PublisherEvent::Error(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!(setup.publisher.status().await.unwrap(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_requires_input_port() {
        let config = test_config(PublishMode::Deltas, false);
        let (tx, _events) = mpsc::unbounded_channel();
        let publisher =
            ControllerPublisher::new("Phone", &config, Arc::new(LoopbackDiscovery::new()), Arc::new(tx)).unwrap();

        let record = ServiceRecord {
            name: "Living Room".into(),
            service_type: "_padlink._tcp.local.".into(),
            host_name: "localhost.".into(),
            addresses: vec![[127, 0, 0, 1].into()],
            port: 9,
            metadata: ServiceMetadata::default(),
        };
        assert!(matches!(
            publisher.connect(record).await,
            Err(PublisherError::Discovery(DiscoveryError::MissingMetadata(_)))
        ));
        assert_eq!(publisher.status().await.unwrap(), ConnectionStatus::Disconnected);

        publisher.start().await.unwrap();
        assert!(matches!(publisher.start().await, Err(PublisherError::AlreadyBrowsing)));
    }

    #[test]
    fn test_invalid_service_identifier() {
        let mut config = Config::default();
        config.discovery.service_identifier = "not valid".into();
        let (tx, _events) = mpsc::unbounded_channel();
        let result = ControllerPublisher::new("Phone", &config, Arc::new(LoopbackDiscovery::new()), Arc::new(tx));
        assert!(matches!(
            result,
            Err(PublisherError::Discovery(DiscoveryError::InvalidServiceIdentifier(_)))
        ));
    }
}
