//! padlink - Game controllers mirrored over the local network
//!
//! A [`ControllerPublisher`] streams the state of local controllers to a
//! [`ControllerBrowser`] found through service discovery. Control messages
//! travel over a stream connection, high-frequency input over datagrams.

pub mod browser;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod network;
pub mod protocol;
pub mod publisher;

pub use browser::{BrowserDelegate, BrowserError, BrowserEvent, ControllerBrowser, ControllerType};
pub use config::Config;
pub use controller::{Controller, ControllerMessage, ControllerOptions, ControllerState, StateChange};
pub use discovery::{LoopbackDiscovery, MdnsDiscovery, ServiceDiscovery};
pub use publisher::{ControllerPublisher, PublisherDelegate, PublisherError, PublisherEvent};
