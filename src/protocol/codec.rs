//! Binary codec for wire messages
//!
//! All multi-byte fields are little-endian regardless of host order. Decoding
//! never fails loudly: a short or malformed buffer yields `None`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ChannelId, ControllerIndex};

/// Size of the datagram envelope header: channel(2) + length(4)
pub const DATAGRAM_HEADER_SIZE: usize = 6;

/// Size of the indexed envelope header
pub const INDEX_HEADER_SIZE: usize = 2;

/// A message with a fixed binary representation
pub trait Marshal: Sized {
    /// Append the encoded message to `buf`
    fn marshal(&self, buf: &mut BytesMut);

    /// Read a message from the reader, `None` if the bytes are malformed
    fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self>;

    /// Encode into a fresh buffer
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.marshal(&mut buf);
        buf.freeze()
    }

    /// Decode from a byte slice
    fn decode(data: &[u8]) -> Option<Self> {
        let mut reader = WireReader::new(data);
        Self::unmarshal(&mut reader)
    }
}

/// Bounds-checked cursor over an inbound buffer
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        (self.data.remaining() >= 1).then(|| self.data.get_u8())
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        (self.data.remaining() >= 2).then(|| self.data.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        (self.data.remaining() >= 4).then(|| self.data.get_u32_le())
    }

    pub fn read_f32(&mut self) -> Option<f32> {
        (self.data.remaining() >= 4).then(|| self.data.get_f32_le())
    }

    /// A single byte, 0 or 1
    pub fn read_bool(&mut self) -> Option<bool> {
        match self.read_u8()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    /// A `u16` ordinal mapped onto an enumeration
    pub fn read_enum<T: TryFrom<u16>>(&mut self) -> Option<T> {
        T::try_from(self.read_u16()?).ok()
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.data.len() < len {
            return None;
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Some(head)
    }

    /// Consume everything left in the buffer
    pub fn read_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }

    /// Unterminated UTF-8 occupying the rest of the buffer
    pub fn read_string(&mut self) -> Option<String> {
        std::str::from_utf8(self.read_rest()).ok().map(str::to_owned)
    }
}

/// Read the channel id of a datagram without decoding the rest
pub fn peek_channel_id(data: &[u8]) -> Option<ChannelId> {
    match data {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

/// Read the payload length of a datagram header
pub fn peek_payload_len(data: &[u8]) -> Option<usize> {
    match data {
        [_, _, a, b, c, d, ..] => Some(u32::from_le_bytes([*a, *b, *c, *d]) as usize),
        _ => None,
    }
}

/// Envelope prefixing a controller index onto a message
#[derive(Debug, Clone, PartialEq)]
pub struct Indexed<T> {
    pub index: ControllerIndex,
    pub message: T,
}

impl<T> Indexed<T> {
    pub fn new(index: ControllerIndex, message: T) -> Self {
        Self { index, message }
    }
}

impl<T: Marshal> Marshal for Indexed<T> {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.index);
        self.message.marshal(buf);
    }

    fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self> {
        let index = reader.read_u16()?;
        let message = T::unmarshal(reader)?;
        Some(Self { index, message })
    }
}

/// Length-prefixed envelope carrying a channel id
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram<T> {
    pub channel: ChannelId,
    pub payload: T,
}

impl<T> Datagram<T> {
    pub fn new(channel: ChannelId, payload: T) -> Self {
        Self { channel, payload }
    }
}

impl<T: Marshal> Marshal for Datagram<T> {
    fn marshal(&self, buf: &mut BytesMut) {
        let mut payload = BytesMut::new();
        self.payload.marshal(&mut payload);

        buf.reserve(DATAGRAM_HEADER_SIZE + payload.len());
        buf.put_u16_le(self.channel);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
    }

    fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self> {
        let channel = reader.read_u16()?;
        let length = reader.read_u32()? as usize;
        let payload = T::decode(reader.read_bytes(length)?)?;
        Some(Self { channel, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Probe(u16);

    impl Marshal for Probe {
        fn marshal(&self, buf: &mut BytesMut) {
            buf.put_u16_le(self.0);
        }

        fn unmarshal(reader: &mut WireReader<'_>) -> Option<Self> {
            reader.read_u16().map(Probe)
        }
    }

    #[test]
    fn test_fields_are_little_endian() {
        let bytes = Indexed::new(0x0102, Probe(0x0304)).encode();
        assert_eq!(&bytes[..], &[0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn test_datagram_layout() {
        let bytes = Datagram::new(3, Probe(7)).encode();
        assert_eq!(&bytes[..], &[3, 0, 2, 0, 0, 0, 7, 0]);
        assert_eq!(peek_channel_id(&bytes), Some(3));
        assert_eq!(peek_payload_len(&bytes), Some(2));
    }

    #[test]
    fn test_datagram_rejects_short_payload() {
        // Header claims 4 bytes but only 2 follow
        let bytes = [3u8, 0, 4, 0, 0, 0, 7, 0];
        assert!(Datagram::<Probe>::decode(&bytes).is_none());
    }

    #[test]
    fn test_datagram_payload_is_bounded_by_length() {
        // Payload is one byte long, too short for a Probe even though more bytes follow
        let bytes = [3u8, 0, 1, 0, 0, 0, 7, 0];
        assert!(Datagram::<Probe>::decode(&bytes).is_none());
    }

    #[test]
    fn test_peek_on_short_buffers() {
        assert_eq!(peek_channel_id(&[]), None);
        assert_eq!(peek_channel_id(&[1]), None);
        assert_eq!(peek_payload_len(&[1, 0, 0]), None);
    }

    #[test]
    fn test_reader_bool_and_string() {
        let mut reader = WireReader::new(&[1, 2]);
        assert_eq!(reader.read_bool(), Some(true));
        assert_eq!(reader.read_bool(), None);

        let mut reader = WireReader::new(&[0xff, 0xfe]);
        assert!(reader.read_string().is_none());

        let mut reader = WireReader::new(b"pad");
        assert_eq!(reader.read_string().as_deref(), Some("pad"));
        assert_eq!(reader.remaining(), 0);
    }
}
