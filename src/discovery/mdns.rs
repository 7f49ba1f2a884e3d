//! mDNS backend built on `mdns-sd`

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    Advertisement, BrowseEvent, DiscoveryError, DiscoveryResult, ServiceDiscovery, ServiceRecord,
};
use crate::protocol::{ServiceMetadata, INPUT_PORT_KEY};

/// Discovery over multicast DNS
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    host_name: String,
    registered: Mutex<HashSet<String>>,
}

impl MdnsDiscovery {
    pub fn new() -> DiscoveryResult<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty() && h.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
            .unwrap_or_else(|| format!("padlink-{}", Uuid::new_v4().simple()));

        Ok(Self {
            daemon,
            host_name: format!("{}.local.", host),
            registered: Mutex::new(HashSet::new()),
        })
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }
}

impl std::fmt::Debug for MdnsDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdnsDiscovery")
            .field("host_name", &self.host_name)
            .finish()
    }
}

#[async_trait]
impl ServiceDiscovery for MdnsDiscovery {
    fn advertise(&self, advertisement: Advertisement) -> DiscoveryResult<()> {
        let properties = txt_properties(&advertisement.metadata);

        let info = ServiceInfo::new(
            &advertisement.service_type,
            &advertisement.name,
            &self.host_name,
            "",
            advertisement.port,
            properties,
        )
        .map_err(|e| DiscoveryError::Registration(e.to_string()))?
        .enable_addr_auto();

        let full_name = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| DiscoveryError::Registration(e.to_string()))?;

        tracing::info!("Advertising {} on port {}", full_name, advertisement.port);
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(full_name);
        Ok(())
    }

    fn withdraw(&self, full_name: &str) -> DiscoveryResult<()> {
        let removed = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(full_name);
        if !removed {
            return Ok(());
        }

        self.daemon
            .unregister(full_name)
            .map_err(|e| DiscoveryError::Registration(e.to_string()))?;
        tracing::info!("Withdrew {}", full_name);
        Ok(())
    }

    fn browse(&self, service_type: &str) -> DiscoveryResult<mpsc::UnboundedReceiver<BrowseEvent>> {
        let receiver = self
            .daemon
            .browse(service_type)
            .map_err(|e| DiscoveryError::Browse(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();

        // The daemon hands out a blocking receiver; pump it from a thread
        std::thread::Builder::new()
            .name(format!("mdns-browse {}", service_type))
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    let event = match event {
                        ServiceEvent::ServiceResolved(info) => BrowseEvent::Found(record_from(&info)),
                        ServiceEvent::ServiceRemoved(_, full_name) => BrowseEvent::Lost { full_name },
                        ServiceEvent::SearchStopped(ty) => {
                            tracing::debug!("Browse for {} stopped", ty);
                            break;
                        }
                        other => {
                            tracing::trace!("mDNS event: {:?}", other);
                            continue;
                        }
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| DiscoveryError::Browse(e.to_string()))?;

        tracing::info!("Browsing for {}", service_type);
        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str) -> DiscoveryResult<()> {
        self.daemon
            .stop_browse(service_type)
            .map_err(|e| DiscoveryError::Browse(e.to_string()))
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        let registered = std::mem::take(
            self.registered
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for full_name in registered {
            let _ = self.daemon.unregister(&full_name);
        }
        let _ = self.daemon.shutdown();
    }
}

fn record_from(info: &ServiceInfo) -> ServiceRecord {
    let service_type = info.get_type().to_string();
    let name = info
        .get_fullname()
        .strip_suffix(&service_type)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or_else(|| info.get_fullname())
        .to_string();

    let metadata: ServiceMetadata = info
        .get_properties()
        .iter()
        .map(|property| {
            let value = property.val().unwrap_or_default();
            (property.key().to_string(), metadata_value(property.key(), value))
        })
        .collect();

    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().map(|a| IpAddr::from(*a)).collect();
    addresses.sort();

    ServiceRecord {
        name,
        service_type,
        host_name: info.get_hostname().to_string(),
        addresses,
        port: info.get_port(),
        metadata,
    }
}

/// TXT properties for `metadata`
///
/// mdns-sd only takes string values, so the input port goes out as decimal
/// text. Other values are kept when they are UTF-8.
fn txt_properties(metadata: &ServiceMetadata) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    for (key, value) in metadata.iter() {
        if key == INPUT_PORT_KEY {
            if let Some(port) = metadata.input_port() {
                properties.insert(key.to_string(), port.to_string());
            }
            continue;
        }
        match std::str::from_utf8(value) {
            Ok(text) => {
                properties.insert(key.to_string(), text.to_string());
            }
            Err(_) => tracing::warn!("Metadata entry {} is not text, not advertised", key),
        }
    }
    properties
}

/// Bring a received TXT value back to its in-memory form
///
/// The input port is accepted as decimal text or as the raw two-byte value.
fn metadata_value(key: &str, value: &[u8]) -> Vec<u8> {
    if key != INPUT_PORT_KEY {
        return value.to_vec();
    }
    let decimal = std::str::from_utf8(value)
        .ok()
        .filter(|text| !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|text| text.parse::<u16>().ok());
    match decimal {
        Some(port) => port.to_le_bytes().to_vec(),
        None => value.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_port_advertised_as_text() {
        let mut metadata = ServiceMetadata::with_input_port(52_000);
        metadata.insert("MODEL", b"pad".to_vec());
        metadata.insert("BLOB", vec![0xff, 0xfe]);

        let properties = txt_properties(&metadata);
        assert_eq!(properties.get(INPUT_PORT_KEY).map(String::as_str), Some("52000"));
        assert_eq!(properties.get("MODEL").map(String::as_str), Some("pad"));
        assert!(!properties.contains_key("BLOB"));

        // mdns-sd accepts the map as is
        let info = ServiceInfo::new("_padlink._tcp.local.", "Den", "den.local.", "", 7100, properties);
        assert!(info.is_ok());
    }

    #[test]
    fn test_unset_input_port_is_not_advertised() {
        let properties = txt_properties(&ServiceMetadata::with_input_port(0));
        assert!(properties.is_empty());
    }

    #[test]
    fn test_received_input_port_forms() {
        let from_text: ServiceMetadata = [(INPUT_PORT_KEY.to_string(), metadata_value(INPUT_PORT_KEY, b"52000"))]
            .into_iter()
            .collect();
        assert_eq!(from_text.input_port(), Some(52_000));

        let raw = 5126u16.to_le_bytes();
        let from_raw: ServiceMetadata = [(INPUT_PORT_KEY.to_string(), metadata_value(INPUT_PORT_KEY, &raw))]
            .into_iter()
            .collect();
        assert_eq!(from_raw.input_port(), Some(5126));

        assert_eq!(metadata_value("MODEL", b"123"), b"123".to_vec());
    }
}
