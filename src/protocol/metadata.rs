//! Service metadata published alongside a discovery record
//!
//! A key/value blob with raw byte values. Each discovery backend decides
//! how the entries travel.

use std::collections::BTreeMap;

/// Key carrying the advertiser's unreliable-socket port
pub const INPUT_PORT_KEY: &str = "INPUT_PORT";

/// Key/value blob attached to an advertised service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMetadata {
    entries: BTreeMap<String, Vec<u8>>,
}

impl ServiceMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata announcing the port of the unreliable socket
    pub fn with_input_port(port: u16) -> Self {
        let mut metadata = Self::new();
        metadata.insert(INPUT_PORT_KEY, port.to_le_bytes().to_vec());
        metadata
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The advertised input port; missing or zero means not yet published
    pub fn input_port(&self) -> Option<u16> {
        match self.get(INPUT_PORT_KEY)? {
            [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])).filter(|port| *port != 0),
            _ => None,
        }
    }
}

impl FromIterator<(String, Vec<u8>)> for ServiceMetadata {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_port_is_little_endian() {
        let metadata = ServiceMetadata::with_input_port(0x1406);
        assert_eq!(metadata.get(INPUT_PORT_KEY), Some(&[0x06, 0x14][..]));
        assert_eq!(metadata.input_port(), Some(0x1406));
    }

    #[test]
    fn test_zero_or_missing_port_is_absent() {
        assert_eq!(ServiceMetadata::with_input_port(0).input_port(), None);
        assert_eq!(ServiceMetadata::new().input_port(), None);

        let mut short = ServiceMetadata::new();
        short.insert(INPUT_PORT_KEY, vec![7]);
        assert_eq!(short.input_port(), None);
    }
}
