//! In-process discovery
//!
//! Services advertised through a [`LoopbackDiscovery`] are visible to
//! browses on the same instance, with a loopback address. Useful for tests
//! and for running a publisher and a browser inside one process.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Advertisement, BrowseEvent, DiscoveryResult, ServiceDiscovery, ServiceRecord};

#[derive(Debug, Default)]
struct Registry {
    services: BTreeMap<String, Advertisement>,
    browsers: Vec<(String, mpsc::UnboundedSender<BrowseEvent>)>,
}

impl Registry {
    fn notify(&mut self, service_type: &str, event: BrowseEvent) {
        self.browsers.retain(|(browsed, tx)| {
            if browsed != service_type {
                return !tx.is_closed();
            }
            tx.send(event.clone()).is_ok()
        });
    }
}

/// Discovery registry shared by everything holding the same instance
#[derive(Debug, Default)]
pub struct LoopbackDiscovery {
    registry: Mutex<Registry>,
}

impl LoopbackDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Full names of everything currently advertised
    pub fn advertised(&self) -> Vec<String> {
        self.registry().services.keys().cloned().collect()
    }
}

fn record_from(advertisement: &Advertisement) -> ServiceRecord {
    ServiceRecord {
        name: advertisement.name.clone(),
        service_type: advertisement.service_type.clone(),
        host_name: "localhost.".to_string(),
        addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        port: advertisement.port,
        metadata: advertisement.metadata.clone(),
    }
}

#[async_trait]
impl ServiceDiscovery for LoopbackDiscovery {
    fn advertise(&self, advertisement: Advertisement) -> DiscoveryResult<()> {
        let full_name = advertisement.full_name();
        let service_type = advertisement.service_type.clone();
        let record = record_from(&advertisement);

        let mut registry = self.registry();
        registry.services.insert(full_name.clone(), advertisement);
        registry.notify(&service_type, BrowseEvent::Found(record));

        tracing::debug!("Loopback advertising {}", full_name);
        Ok(())
    }

    fn withdraw(&self, full_name: &str) -> DiscoveryResult<()> {
        let mut registry = self.registry();
        if let Some(advertisement) = registry.services.remove(full_name) {
            registry.notify(
                &advertisement.service_type,
                BrowseEvent::Lost {
                    full_name: full_name.to_string(),
                },
            );
            tracing::debug!("Loopback withdrew {}", full_name);
        }
        Ok(())
    }

    fn browse(&self, service_type: &str) -> DiscoveryResult<mpsc::UnboundedReceiver<BrowseEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry();

        for advertisement in registry.services.values() {
            if advertisement.service_type == service_type {
                let _ = tx.send(BrowseEvent::Found(record_from(advertisement)));
            }
        }
        registry.browsers.push((service_type.to_string(), tx));
        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str) -> DiscoveryResult<()> {
        self.registry()
            .browsers
            .retain(|(browsed, _)| browsed != service_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServiceMetadata;

    const TYPE: &str = "_padlink._tcp.local.";

    fn advertisement(name: &str) -> Advertisement {
        Advertisement {
            name: name.to_string(),
            service_type: TYPE.to_string(),
            port: 7000,
            metadata: ServiceMetadata::with_input_port(7001),
        }
    }

    #[tokio::test]
    async fn test_browse_sees_existing_and_new_services() {
        let discovery = LoopbackDiscovery::new();
        discovery.advertise(advertisement("first")).unwrap();

        let mut events = discovery.browse(TYPE).unwrap();
        discovery.advertise(advertisement("second")).unwrap();

        let names: Vec<String> = [events.recv().await, events.recv().await]
            .into_iter()
            .map(|event| match event {
                Some(BrowseEvent::Found(record)) => record.name,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[tokio::test]
    async fn test_records_carry_loopback_address_and_metadata() {
        let discovery = LoopbackDiscovery::new();
        let mut events = discovery.browse(TYPE).unwrap();
        discovery.advertise(advertisement("pad")).unwrap();

        let Some(BrowseEvent::Found(record)) = events.recv().await else {
            panic!("expected a record");
        };
        assert_eq!(record.metadata.input_port(), Some(7001));
        let addr = discovery.resolve(&record).await.unwrap();
        assert_eq!(addr, "127.0.0.1:7000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_withdraw_and_stop_browse() {
        let discovery = LoopbackDiscovery::new();
        let mut events = discovery.browse(TYPE).unwrap();
        let mut other = discovery.browse("_other._tcp.local.").unwrap();

        discovery.advertise(advertisement("pad")).unwrap();
        discovery.withdraw("pad._padlink._tcp.local.").unwrap();
        discovery.withdraw("pad._padlink._tcp.local.").unwrap();
        assert!(discovery.advertised().is_empty());

        assert!(matches!(events.recv().await, Some(BrowseEvent::Found(_))));
        assert_eq!(
            events.recv().await,
            Some(BrowseEvent::Lost {
                full_name: "pad._padlink._tcp.local.".to_string()
            })
        );
        assert!(other.try_recv().is_err());

        discovery.stop_browse(TYPE).unwrap();
        assert_eq!(events.recv().await, None);
    }
}
