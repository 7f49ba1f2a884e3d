//! Channel registration shared by both transports

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::{ChannelId, Datagram, Marshal};

/// Transport a channel is multiplexed over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Reliable,
    Unreliable,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Reliable => f.write_str("reliable"),
            Transport::Unreliable => f.write_str("unreliable"),
        }
    }
}

/// Process-unique identifier of a stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Callback invoked with a complete inbound frame, header included
pub type InboundHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Wrap a typed callback into a handler that decodes the frame first.
/// Malformed frames are logged and dropped.
pub fn read_handler<T, F>(channel: ChannelId, mut on_message: F) -> InboundHandler
where
    T: Marshal,
    F: FnMut(T) + Send + 'static,
{
    Box::new(move |frame: &[u8]| match Datagram::<T>::decode(frame) {
        Some(datagram) => on_message(datagram.payload),
        None => tracing::debug!(
            "Dropping malformed frame of {} bytes on channel {}",
            frame.len(),
            channel
        ),
    })
}

/// Registered read channels, keyed per transport
pub struct ChannelTable<K> {
    handlers: HashMap<K, InboundHandler>,
}

impl<K: Eq + Hash + fmt::Debug> ChannelTable<K> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler; returns false if the key is taken
    pub fn insert(&mut self, key: K, handler: InboundHandler) -> bool {
        match self.handlers.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.handlers.remove(key).is_some()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.handlers.retain(|key, _| keep(key));
    }

    pub fn contains(&self, key: &K) -> bool {
        self.handlers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Hand `frame` to the handler under `key`; unknown keys are discarded
    pub fn dispatch(&mut self, key: &K, frame: &[u8]) -> bool {
        match self.handlers.get_mut(key) {
            Some(handler) => {
                handler(frame);
                true
            }
            None => {
                tracing::trace!("Discarding frame for unregistered channel {:?}", key);
                false
            }
        }
    }
}

impl<K: Eq + Hash + fmt::Debug> Default for ChannelTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug> fmt::Debug for ChannelTable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ButtonChanged, ButtonKind, ButtonState, Indexed};
    use std::net::IpAddr;
    use std::sync::{Arc, Mutex};

    fn button(value: f32) -> Indexed<ButtonChanged> {
        Indexed::new(
            0,
            ButtonChanged {
                button: ButtonKind::A,
                state: ButtonState::new(value, true),
            },
        )
    }

    #[test]
    fn test_same_id_different_hosts_route_independently() {
        let host_a: IpAddr = [10, 0, 0, 1].into();
        let host_b: IpAddr = [10, 0, 0, 2].into();
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));

        let mut table = ChannelTable::new();
        let sink = seen_a.clone();
        assert!(table.insert(
            (host_a, 3),
            read_handler::<Indexed<ButtonChanged>, _>(3, move |m| sink.lock().unwrap().push(m))
        ));
        let sink = seen_b.clone();
        assert!(table.insert(
            (host_b, 3),
            read_handler::<Indexed<ButtonChanged>, _>(3, move |m| sink.lock().unwrap().push(m))
        ));

        let frame = Datagram::new(3, button(0.5)).encode();
        assert!(table.dispatch(&(host_a, 3), &frame));

        assert_eq!(seen_a.lock().unwrap().as_slice(), &[button(0.5)]);
        assert!(seen_b.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut table = ChannelTable::new();
        assert!(table.insert(1u16, Box::new(|_: &[u8]| {})));
        assert!(!table.insert(1u16, Box::new(|_: &[u8]| {})));
        assert_eq!(table.len(), 1);

        assert!(table.remove(&1));
        assert!(!table.remove(&1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_malformed_and_unknown_frames_are_dropped() {
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let mut table = ChannelTable::new();
        table.insert(
            4u16,
            read_handler::<Indexed<ButtonChanged>, _>(4, move |_| *sink.lock().unwrap() += 1),
        );

        let frame = Datagram::new(4, button(1.0)).encode();
        assert!(table.dispatch(&4, &frame[..frame.len() - 1]));
        assert!(!table.dispatch(&9, &frame));
        assert_eq!(*count.lock().unwrap(), 0);

        assert!(table.dispatch(&4, &frame));
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
