//! Network module - Multiplexed channels over UDP and TCP
//!
//! Provides:
//! - A shared datagram socket demultiplexed by (source host, channel id)
//! - Per-peer stream connections demultiplexed by channel id
//! - Length-prefixed framing shared by both transports

mod channel;
mod tcp;
mod udp;

pub use channel::*;
pub use tcp::*;
pub use udp::*;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ChannelId;

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel {id} already registered on {transport} transport for {host:?}")]
    DuplicateChannel {
        transport: Transport,
        host: Option<IpAddr>,
        id: ChannelId,
    },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Frame of {0} bytes exceeds limit of {1}")]
    FrameTooLarge(usize, usize),

    #[error("Connection timeout")]
    Timeout,
}

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Local address sockets are bound to
    pub bind_address: IpAddr,
    /// Port of the stream listener, 0 for an OS-assigned port
    pub control_port: u16,
    /// Port of the datagram socket, 0 for an OS-assigned port
    pub input_port: u16,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Maximum size of a single frame on the stream transport
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            control_port: 0,
            input_port: 0,
            connect_timeout_ms: 5000,
            max_frame_size: 64 * 1024,
        }
    }
}

impl NetworkConfig {
    /// Loopback-only configuration with OS-assigned ports
    pub fn loopback() -> Self {
        Self {
            bind_address: IpAddr::from([127, 0, 0, 1]),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
