//! Datagram header codec.
//!
//! Every UDP payload starts with a fixed 16-byte header:
//!
//! ```text
//! version:u8 | type:u8 | subtype:u8 | reserved:u8 | remote_index:u32 | counter:u64
//! ```
//!
//! All fields are big-endian, except the counter which is little-endian
//! when the session cipher is chachapoly (the counter doubles as the AEAD
//! nonce and keeps the historical nonce byte order of that cipher).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{CoreError, CoreResult};

/// Total encoded header length
pub const HEADER_LEN: usize = 16;

/// Current wire version
pub const WIRE_VERSION: u8 = 1;

/// Subtype carried by most messages
pub const SUBTYPE_NONE: u8 = 0;
/// `Message` subtype for relayed payloads
pub const MESSAGE_RELAY: u8 = 1;
/// `Handshake` subtype for the initiator's first message
pub const HANDSHAKE_HELLO: u8 = 1;
/// `Handshake` subtype for the responder's reply
pub const HANDSHAKE_REPLY: u8 = 2;
/// `Test` subtype asking for an echo
pub const TEST_REQUEST: u8 = 0;
/// `Test` subtype carrying the echo
pub const TEST_REPLY: u8 = 1;

/// Datagram message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 1,
    Message = 2,
    RecvError = 3,
    LightHouse = 4,
    Test = 5,
    CloseTunnel = 6,
    Control = 9,
}

impl TryFrom<u8> for MessageType {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Handshake),
            2 => Ok(Self::Message),
            3 => Ok(Self::RecvError),
            4 => Ok(Self::LightHouse),
            5 => Ok(Self::Test),
            6 => Ok(Self::CloseTunnel),
            9 => Ok(Self::Control),
            _ => Err(CoreError::InvalidHeader(format!(
                "unknown message type: {}",
                value
            ))),
        }
    }
}

/// Decoded datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub typ: MessageType,
    pub subtype: u8,
    pub remote_index: u32,
    pub message_counter: u64,
}

impl Header {
    pub fn new(typ: MessageType, subtype: u8, remote_index: u32, message_counter: u64) -> Self {
        Self {
            version: WIRE_VERSION,
            typ,
            subtype,
            remote_index,
            message_counter,
        }
    }

    /// Encode into a fresh 16-byte array.
    /// `counter_le` selects the chachapoly counter byte order.
    pub fn encode(&self, counter_le: bool) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.version;
        buf[1] = self.typ as u8;
        buf[2] = self.subtype;
        buf[4..8].copy_from_slice(&self.remote_index.to_be_bytes());
        if counter_le {
            buf[8..16].copy_from_slice(&self.message_counter.to_le_bytes());
        } else {
            buf[8..16].copy_from_slice(&self.message_counter.to_be_bytes());
        }
        buf
    }

    /// Append the encoded header to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut, counter_le: bool) {
        buf.put_slice(&self.encode(counter_le));
    }

    /// Parse a header off the front of `data`
    pub fn decode(data: &[u8], counter_le: bool) -> CoreResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(CoreError::InvalidHeader(format!(
                "packet too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = &data[..HEADER_LEN];
        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(CoreError::InvalidHeader(format!(
                "unknown wire version: {}",
                version
            )));
        }

        let typ = MessageType::try_from(buf.get_u8())?;
        let subtype = buf.get_u8();
        let _reserved = buf.get_u8();
        let remote_index = buf.get_u32();
        let message_counter = if counter_le {
            buf.get_u64_le()
        } else {
            buf.get_u64()
        };

        Ok(Self {
            version,
            typ,
            subtype,
            remote_index,
            message_counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let h = Header::new(MessageType::Message, SUBTYPE_NONE, 0xdead_beef, 42);
        for counter_le in [false, true] {
            let bytes = h.encode(counter_le);
            assert_eq!(bytes.len(), HEADER_LEN);
            let decoded = Header::decode(&bytes, counter_le).unwrap();
            assert_eq!(decoded, h);
        }
    }

    #[test]
    fn test_counter_endianness_differs() {
        let h = Header::new(MessageType::Message, SUBTYPE_NONE, 1, 0x0102_0304_0506_0708);
        let be = h.encode(false);
        let le = h.encode(true);
        assert_eq!(be[..8], le[..8]);
        assert_ne!(be[8..], le[8..]);
        let mut reversed = le[8..].to_vec();
        reversed.reverse();
        assert_eq!(be[8..], reversed[..]);
    }

    #[test]
    fn test_decode_rejects_short() {
        assert!(Header::decode(&[1, 2, 0, 0], false).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let mut bytes = Header::new(MessageType::Test, TEST_REQUEST, 7, 0).encode(false);
        bytes[0] = 9;
        assert!(Header::decode(&bytes, false).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut bytes = Header::new(MessageType::Test, TEST_REQUEST, 7, 0).encode(false);
        bytes[1] = 200;
        assert!(Header::decode(&bytes, false).is_err());
    }

    #[test]
    fn test_all_types_roundtrip() {
        let types = [
            MessageType::Handshake,
            MessageType::Message,
            MessageType::RecvError,
            MessageType::LightHouse,
            MessageType::Test,
            MessageType::CloseTunnel,
            MessageType::Control,
        ];
        for t in types {
            let h = Header::new(t, 1, 5, 6);
            let decoded = Header::decode(&h.encode(false), false).unwrap();
            assert_eq!(decoded.typ, t);
        }
    }
}
