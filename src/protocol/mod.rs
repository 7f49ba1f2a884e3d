//! Protocol module - Defines the wire protocol for padlink communication
//!
//! Every message is a little-endian binary record. Two envelopes wrap them:
//! - indexed: 2 bytes controller index, then the inner message
//! - datagram: 2 bytes channel id, 4 bytes payload length, then the payload
//!
//! The datagram envelope is self-delimiting, so the same framing is used on
//! the reliable stream and on the unreliable socket.

mod codec;
mod message;
mod metadata;

pub use codec::*;
pub use message::*;
pub use metadata::*;

/// Protocol version announced in `ControllerConnected`
pub const PROTOCOL_VERSION: u16 = 1;

/// Identifies one logical controller within its owning registry
pub type ControllerIndex = u16;

/// Identifies a logical sub-stream multiplexed over a shared socket
pub type ChannelId = u16;

/// Channel ids on the reliable (stream) transport
pub mod reliable {
    use super::ChannelId;

    pub const CONTROLLER_CONNECTED: ChannelId = 1;
    pub const CONTROLLER_DISCONNECTED: ChannelId = 2;
    pub const CONTROLLER_NAME: ChannelId = 3;
    pub const CONTROLLER_LAYOUT: ChannelId = 4;
}

/// Channel ids on the unreliable (datagram) transport
pub mod unreliable {
    use super::ChannelId;

    pub const GAMEPAD: ChannelId = 1;
    pub const JOYSTICK: ChannelId = 3;
    pub const BUTTON: ChannelId = 4;
}
