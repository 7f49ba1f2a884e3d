//! Service discovery module
//!
//! Advertises and browses DNS-SD style services. Two backends implement
//! [`ServiceDiscovery`]: mDNS on the local network, and an in-process
//! loopback registry for running both roles inside one process.

mod loopback;
mod mdns;

pub use loopback::LoopbackDiscovery;
pub use mdns::MdnsDiscovery;

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::ServiceMetadata;

/// Domain every service type lives in
pub const SERVICE_DOMAIN: &str = "local.";

/// Longest allowed service identifier
pub const MAX_SERVICE_IDENTIFIER_LEN: usize = 15;

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(String),

    #[error("Service registration failed: {0}")]
    Registration(String),

    #[error("Browse failed: {0}")]
    Browse(String),

    #[error("Could not resolve {name}: {reason}")]
    Resolve { name: String, reason: String },

    #[error("Service {0} has no input port in its metadata")]
    MissingMetadata(String),

    #[error("Invalid service identifier {0:?}: expected 1-15 letters, digits or hyphens")]
    InvalidServiceIdentifier(String),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Check a service identifier: 1-15 ASCII letters, digits or inner hyphens
pub fn validate_service_identifier(identifier: &str) -> DiscoveryResult<()> {
    let valid = !identifier.is_empty()
        && identifier.len() <= MAX_SERVICE_IDENTIFIER_LEN
        && identifier.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !identifier.starts_with('-')
        && !identifier.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(DiscoveryError::InvalidServiceIdentifier(identifier.to_string()))
    }
}

/// Full service type for an identifier, e.g. `_padlink._tcp.local.`
pub fn service_type(identifier: &str) -> DiscoveryResult<String> {
    validate_service_identifier(identifier)?;
    Ok(format!("_{}._tcp.{}", identifier, SERVICE_DOMAIN))
}

/// Fully qualified instance name
pub fn full_name(name: &str, service_type: &str) -> String {
    format!("{}.{}", name, service_type)
}

/// A service this process publishes
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Instance name
    pub name: String,
    pub service_type: String,
    /// Port of the stream listener
    pub port: u16,
    pub metadata: ServiceMetadata,
}

impl Advertisement {
    pub fn full_name(&self) -> String {
        full_name(&self.name, &self.service_type)
    }
}

/// A service found while browsing
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    /// Instance name
    pub name: String,
    pub service_type: String,
    pub host_name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub metadata: ServiceMetadata,
}

impl ServiceRecord {
    pub fn full_name(&self) -> String {
        full_name(&self.name, &self.service_type)
    }

    /// First advertised address, IPv4 preferred
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| self.addresses.first())
            .map(|ip| SocketAddr::new(*ip, self.port))
    }
}

/// Events produced by a browse
#[derive(Debug, Clone, PartialEq)]
pub enum BrowseEvent {
    /// A service was resolved, or its record changed
    Found(ServiceRecord),
    /// A service went away
    Lost { full_name: String },
}

/// Advertise, browse and resolve services
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Publish a service
    fn advertise(&self, advertisement: Advertisement) -> DiscoveryResult<()>;

    /// Withdraw a previously published service
    fn withdraw(&self, full_name: &str) -> DiscoveryResult<()>;

    /// Start browsing `service_type`
    fn browse(&self, service_type: &str) -> DiscoveryResult<mpsc::UnboundedReceiver<BrowseEvent>>;

    /// Stop a browse; its receiver closes
    fn stop_browse(&self, service_type: &str) -> DiscoveryResult<()>;

    /// Address of the service's stream listener
    async fn resolve(&self, record: &ServiceRecord) -> DiscoveryResult<SocketAddr> {
        if let Some(addr) = record.socket_addr() {
            return Ok(addr);
        }

        crate::network::resolve_host(record.host_name.trim_end_matches('.'), record.port)
            .await
            .map_err(|e| DiscoveryError::Resolve {
                name: record.full_name(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(addresses: Vec<IpAddr>) -> ServiceRecord {
        ServiceRecord {
            name: "Pad1".into(),
            service_type: "_padlink._tcp.local.".into(),
            host_name: "localhost.".into(),
            addresses,
            port: 4000,
            metadata: ServiceMetadata::with_input_port(4001),
        }
    }

    #[test]
    fn test_service_type() {
        assert_eq!(service_type("padlink").unwrap(), "_padlink._tcp.local.");
        assert_eq!(service_type("a").unwrap(), "_a._tcp.local.");
        assert_eq!(service_type("fifteen-chars-x").unwrap(), "_fifteen-chars-x._tcp.local.");
    }

    #[test]
    fn test_invalid_identifiers() {
        for identifier in ["", "sixteen-chars-xx", "with space", "-lead", "trail-", "dot.ted"] {
            assert!(
                matches!(service_type(identifier), Err(DiscoveryError::InvalidServiceIdentifier(_))),
                "{identifier:?} accepted"
            );
        }
    }

    #[test]
    fn test_socket_addr_prefers_ipv4() {
        let v6: IpAddr = "fe80::1".parse().unwrap();
        let v4: IpAddr = [192, 168, 1, 5].into();
        let record = record(vec![v6, v4]);
        assert_eq!(record.socket_addr(), Some(SocketAddr::new(v4, 4000)));
        assert_eq!(record.full_name(), "Pad1._padlink._tcp.local.");
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_host_name() {
        let discovery = LoopbackDiscovery::new();
        let addr = discovery.resolve(&record(Vec::new())).await.unwrap();
        assert_eq!(addr.port(), 4000);
        assert!(addr.ip().is_loopback());
    }
}
